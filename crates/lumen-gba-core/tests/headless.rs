//! End-to-end exercise of the host/core boundary: a background emulator
//! thread driven purely through the message channel and observed through the
//! shared data block.

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use lumen_gba_core::channel::{Key, Message};
use lumen_gba_core::gba::{Gba, LaunchConfig};

#[test]
fn emulator_thread_runs_frames_and_exits_cleanly() {
    let mut gba = Gba::new();
    let channel = gba.channel();
    let shared = gba.shared();

    channel.push(Message::Reset(Box::new(LaunchConfig {
        rom: common::rom_with_code(0xC0, b"HEAD"),
        ..Default::default()
    })));
    channel.push(Message::Run);
    channel.push(Message::Key {
        key: Key::Start,
        pressed: true,
    });

    let handle = thread::spawn(move || {
        gba.run();
        gba
    });

    // Wait until the core has published at least two frames.
    let deadline = Instant::now() + Duration::from_secs(30);
    let mut frames = 0u32;
    let mut version = 0u64;
    while frames < 2 {
        assert!(Instant::now() < deadline, "no frames within the deadline");
        frames += shared.take_frame_counter();
        version = shared.framebuffer_version();
        thread::sleep(Duration::from_millis(1));
    }
    assert!(version >= 1);

    // Quicksave through the channel observes a quiescent machine.
    let (reply, result) = mpsc::channel();
    channel.push(Message::Quicksave(reply));
    let save = result.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(&save[0..4], b"HSQS");

    channel.push(Message::Exit);
    let gba = handle.join().unwrap();

    // The Start key was latched into KEYINPUT (active-low).
    assert_eq!(gba.io.keyinput & (1 << 3), 0);
}
