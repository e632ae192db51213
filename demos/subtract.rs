use imbs::{BackgroundSubtractor, BgrFrame, Config, FgMask};

// Runs the subtractor over a synthetic sequence: a static grey scene with
// a small square that starts moving once the model has warmed up, then
// parks and gets absorbed. Prints per-frame label counts.
fn main() {
    env_logger::init();

    let (width, height) = (64u32, 48u32);
    let config = Config { fps: 25.0, ..Config::default() };
    let mut sub = BackgroundSubtractor::new(config).unwrap();
    let mut mask = FgMask::default();

    for frame_no in 0..1200u32 {
        let mut frame = BgrFrame::new(width, height);
        frame.data.fill(90);

        // after warm-up, sweep a 8x8 square across the scene
        if frame_no > 500 {
            let x0 = (frame_no / 4) % (width - 8);
            for y in 20..28 {
                for x in x0..x0 + 8 {
                    let i = (y as usize * width as usize + x as usize) * 3;
                    frame.data[i..i + 3].copy_from_slice(&[30, 30, 200]);
                }
            }
        }

        sub.apply(&frame, &mut mask).unwrap();

        if frame_no % 50 == 0 {
            let fg = mask.data.iter().filter(|&&l| l == imbs::FOREGROUND_LABEL).count();
            let shadow = mask.data.iter().filter(|&&l| l == imbs::SHADOW_LABEL).count();
            let persistent = mask.data.iter().filter(|&&l| l == imbs::PERSISTENCE_LABEL).count();
            println!("frame {frame_no:4}: fg {fg:4}  shadow {shadow:4}  persistent {persistent:4}");
        }
    }
}
