// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use imbs::{
    BackgroundSubtractor, BgrFrame, Config, Error, FgMask, FOREGROUND_LABEL, PERSISTENCE_LABEL,
    SHADOW_LABEL,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A 4x1 frame from four BGR triples.
fn strip(colors: [[u8; 3]; 4]) -> BgrFrame {
    let mut data = Vec::with_capacity(12);
    for c in colors {
        data.extend_from_slice(&c);
    }
    BgrFrame::from_data(4, 1, data).expect("strip")
}

fn apply(sub: &mut BackgroundSubtractor, frame: &BgrFrame, mask: &mut FgMask, ts: f64) {
    sub.apply_at(frame, mask, ts).expect("apply");
}

fn scenario_config() -> Config {
    Config {
        fps: 0.0,
        fg_threshold: 10,
        sampling_period_ms: 100.0,
        min_bin_height: 2,
        num_samples: 6,
        num_workers: 1,
        ..Config::default()
    }
}

/// Feed identical frames until the stable model commits: samples land at
/// t = 100..500 ms and the window commits on the 600 ms frame. Returns
/// the subtractor and the next free timestamp (700 ms).
fn warmed(color: [u8; 3]) -> (BackgroundSubtractor, BgrFrame, f64) {
    let mut sub = BackgroundSubtractor::new(scenario_config()).expect("subtractor");
    let frame = strip([color; 4]);
    let mut mask = FgMask::default();
    let mut ts = 0.0;
    for _ in 0..=6 {
        apply(&mut sub, &frame, &mut mask, ts);
        ts += 100.0;
    }
    (sub, frame, ts)
}

#[test]
fn first_apply_yields_an_empty_mask() {
    init_logging();
    let mut sub = BackgroundSubtractor::new(scenario_config()).expect("subtractor");
    let frame = strip([[37, 99, 140]; 4]);
    let mut mask = FgMask::default();
    apply(&mut sub, &frame, &mut mask, 0.0);
    assert_eq!((mask.width, mask.height), (4, 1));
    assert!(mask.data.iter().all(|&l| l == 0));
}

#[test]
fn constant_color_warmup_commits_the_input_color() {
    init_logging();
    let (mut sub, frame, ts) = warmed([100, 100, 100]);
    let mut mask = FgMask::default();
    apply(&mut sub, &frame, &mut mask, ts);
    assert!(mask.data.iter().all(|&l| l == 0));
    let bg = sub.background_image();
    for x in 0..4 {
        assert_eq!(bg.pixel(x, 0), [100, 100, 100]);
    }
}

#[test]
fn single_pixel_flash_is_exactly_one_foreground_pixel() {
    init_logging();
    let (mut sub, frame, ts) = warmed([100, 100, 100]);
    let flash = strip([
        [100, 100, 100],
        [200, 100, 100],
        [100, 100, 100],
        [100, 100, 100],
    ]);
    let mut mask = FgMask::default();
    apply(&mut sub, &flash, &mut mask, ts);
    assert_eq!(mask.data, vec![0, FOREGROUND_LABEL, 0, 0]);

    // back on model: clean mask again
    apply(&mut sub, &frame, &mut mask, ts + 100.0);
    assert!(mask.data.iter().all(|&l| l == 0));
}

#[test]
fn uniform_shading_is_labeled_shadow_within_the_ratio_band() {
    init_logging();
    let (mut sub, _frame, ts) = warmed([100, 100, 100]);
    let mut mask = FgMask::default();

    let shaded = strip([[100; 3], [65, 65, 65], [100; 3], [100; 3]]);
    apply(&mut sub, &shaded, &mut mask, ts);
    assert_eq!(mask.data[1], SHADOW_LABEL);

    let brightened = strip([[100; 3], [114, 114, 114], [100; 3], [100; 3]]);
    apply(&mut sub, &brightened, &mut mask, ts + 100.0);
    assert_eq!(mask.data[1], SHADOW_LABEL);

    // at the upper ratio bound the pixel is foreground again
    let too_bright = strip([[100; 3], [115, 115, 115], [100; 3], [100; 3]]);
    apply(&mut sub, &too_bright, &mut mask, ts + 200.0);
    assert_eq!(mask.data[1], FOREGROUND_LABEL);
}

#[test]
fn stationary_object_is_absorbed_after_the_persistence_period() {
    init_logging();
    let config = Config {
        sampling_period_ms: 2000.0,
        persistence_period_ms: 300.0,
        ..scenario_config()
    };
    let mut sub = BackgroundSubtractor::new(config).expect("subtractor");
    let background = strip([[100; 3]; 4]);
    let object = strip([[100; 3], [200, 100, 100], [100; 3], [100; 3]]);
    let mut mask = FgMask::default();

    // stable samples at 2, 4, .., 10 s; the model commits at 10.1 s
    let mut ts = 0.0;
    while ts <= 10_100.0 {
        apply(&mut sub, &background, &mut mask, ts);
        ts += 100.0;
    }
    assert!(mask.data.iter().all(|&l| l == 0));

    // the object appears and holds through one full sampling window:
    // hard foreground until the window (sampled at 12..20 s) commits
    let mut labels = Vec::new();
    while ts <= 22_000.0 {
        apply(&mut sub, &object, &mut mask, ts);
        labels.push(mask.data[1]);
        ts += 100.0;
    }
    assert!(labels.contains(&FOREGROUND_LABEL));
    assert!(labels.contains(&PERSISTENCE_LABEL));
    // dwell passed 300 ms well before 22 s: absorbed into the background
    assert_eq!(mask.data[1], 0);
    assert_eq!(mask.data[0], 0);

    // and it stays background
    apply(&mut sub, &object, &mut mask, ts);
    assert!(mask.data.iter().all(|&l| l == 0));
}

#[test]
fn persistence_decays_at_the_next_commit_even_without_dwell() {
    init_logging();
    // persistence period far beyond the test horizon: absorption can only
    // come from re-learning the pixel with unflagged samples
    let config = Config {
        sampling_period_ms: 2000.0,
        persistence_period_ms: 1e9,
        ..scenario_config()
    };
    let mut sub = BackgroundSubtractor::new(config).expect("subtractor");
    let background = strip([[100; 3]; 4]);
    let object = strip([[100; 3], [200, 100, 100], [100; 3], [100; 3]]);
    let mut mask = FgMask::default();

    let mut ts = 0.0;
    while ts <= 10_100.0 {
        apply(&mut sub, &background, &mut mask, ts);
        ts += 100.0;
    }

    let mut labels = Vec::new();
    while ts <= 32_000.0 {
        apply(&mut sub, &object, &mut mask, ts);
        labels.push(mask.data[1]);
        ts += 100.0;
    }
    let first_persistence = labels.iter().position(|&l| l == PERSISTENCE_LABEL);
    assert!(first_persistence.is_some(), "object never became persistent");
    assert_eq!(mask.data[1], 0, "object never absorbed");
    let last_nonzero = labels.iter().rposition(|&l| l != 0).expect("object was never visible");
    assert!(
        last_nonzero > first_persistence.expect("checked above"),
        "absorption must follow persistence"
    );
}

#[test]
fn reapplying_the_same_frame_with_no_time_advance_is_idempotent() {
    init_logging();
    let (mut sub, _frame, ts) = warmed([100, 100, 100]);
    let probe = strip([[100; 3], [180, 90, 90], [100; 3], [65, 65, 65]]);
    let mut first = FgMask::default();
    let mut second = FgMask::default();
    apply(&mut sub, &probe, &mut first, ts);
    apply(&mut sub, &probe, &mut second, ts);
    assert_eq!(first.data, second.data);
}

#[test]
fn mask_values_stay_in_the_four_label_palette() {
    init_logging();
    let (mut sub, _frame, mut ts) = warmed([100, 100, 100]);
    let frames = [
        strip([[100; 3], [200, 100, 100], [65, 65, 65], [100; 3]]),
        strip([[0, 0, 0], [255, 255, 255], [114, 114, 114], [100; 3]]),
        strip([[90, 90, 90], [100; 3], [100; 3], [120, 120, 120]]),
    ];
    for _ in 0..20 {
        for frame in &frames {
            let mut mask = FgMask::default();
            apply(&mut sub, frame, &mut mask, ts);
            ts += 100.0;
            for &label in &mask.data {
                assert!(
                    label == 0
                        || label == SHADOW_LABEL
                        || label == PERSISTENCE_LABEL
                        || label == FOREGROUND_LABEL,
                    "unexpected label {label}"
                );
            }
        }
    }
}

#[test]
fn saved_model_reloads_to_a_silent_background() {
    init_logging();
    let (mut sub, frame, _ts) = warmed([100, 100, 100]);
    let mut text = Vec::new();
    sub.save_model(&mut text).expect("save");

    let mut reloaded =
        BackgroundSubtractor::load_model(scenario_config(), text.as_slice()).expect("load");
    let bg = reloaded.background_image();
    for x in 0..4 {
        assert_eq!(bg.pixel(x, 0), [100, 100, 100]);
    }

    let mut mask = FgMask::default();
    reloaded.apply_at(&frame, &mut mask, 0.0).expect("apply");
    assert!(mask.data.iter().all(|&l| l == 0));
}

#[test]
fn save_before_first_frame_is_an_error() {
    let mut sub = BackgroundSubtractor::new(scenario_config()).expect("subtractor");
    let mut text = Vec::new();
    match sub.save_model(&mut text) {
        Err(Error::ModelFormat(_)) => {}
        other => panic!("expected a model error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn frame_shape_is_fixed_by_the_first_apply() {
    init_logging();
    let mut sub = BackgroundSubtractor::new(scenario_config()).expect("subtractor");
    let mut mask = FgMask::default();
    apply(&mut sub, &strip([[10; 3]; 4]), &mut mask, 0.0);

    let wider = BgrFrame::new(5, 1);
    match sub.apply_at(&wider, &mut mask, 100.0) {
        Err(Error::ShapeMismatch(_)) => {}
        other => panic!("expected a shape error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn incremental_model_covers_the_warmup_phase() {
    init_logging();
    // a long stable window: first stable commit would land near 15 s, the
    // incremental model is ready after ~600 ms
    let config = Config {
        num_samples: 30,
        sampling_period_ms: 500.0,
        ..scenario_config()
    };
    let mut sub = BackgroundSubtractor::new(config).expect("subtractor");
    let frame = strip([[100; 3]; 4]);
    let mut mask = FgMask::default();
    let mut ts = 0.0;
    while ts <= 600.0 {
        apply(&mut sub, &frame, &mut mask, ts);
        ts += 100.0;
    }

    let flash = strip([[100; 3], [200, 100, 100], [100; 3], [100; 3]]);
    apply(&mut sub, &flash, &mut mask, ts);
    assert_eq!(mask.data, vec![0, FOREGROUND_LABEL, 0, 0]);
}

#[test]
fn illumination_change_recovers_through_the_incremental_model() {
    init_logging();
    let (mut sub, _frame, mut ts) = warmed([100, 100, 100]);
    let brighter = strip([[200, 200, 200]; 4]);
    let mut mask = FgMask::default();

    apply(&mut sub, &brighter, &mut mask, ts);
    assert!(mask.data.iter().all(|&l| l == FOREGROUND_LABEL));

    let mut saw_persistence = false;
    for _ in 0..30 {
        ts += 100.0;
        apply(&mut sub, &brighter, &mut mask, ts);
        saw_persistence |= mask.data.iter().any(|&l| l == PERSISTENCE_LABEL);
    }
    assert!(saw_persistence, "the relearned scene never went persistent");
    assert!(
        mask.data.iter().all(|&l| l == 0),
        "the new illumination was not absorbed: {:?}",
        mask.data
    );
}

#[test]
fn pixels_outside_the_tile_grid_stay_zero() {
    init_logging();
    // 5x3 with two workers tiles into two 5x1 rows; row 2 is remainder
    let config = Config { num_workers: 2, ..scenario_config() };
    let mut sub = BackgroundSubtractor::new(config).expect("subtractor");
    let grey = BgrFrame::from_data(5, 3, vec![100; 45]).expect("frame");
    let bright = BgrFrame::from_data(5, 3, vec![200; 45]).expect("frame");
    let mut mask = FgMask::default();

    let mut ts = 0.0;
    for _ in 0..=6 {
        apply(&mut sub, &grey, &mut mask, ts);
        ts += 100.0;
    }
    apply(&mut sub, &bright, &mut mask, ts);
    for y in 0..2 {
        for x in 0..5 {
            assert_eq!(mask.label(x, y), FOREGROUND_LABEL);
        }
    }
    for x in 0..5 {
        assert_eq!(mask.label(x, 2), 0);
    }
}
