#![no_main]

use framewire::core::token::{ByteOrder, FrameFormat, LengthPrefix, MessageToken};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary byte streams must never panic the framing state machine;
    // the first byte picks the read size.
    let Some((&split, rest)) = data.split_first() else {
        return;
    };
    let format = FrameFormat::new(LengthPrefix::U24, ByteOrder::Little, 4096);
    let mut token = MessageToken::new(format);

    for chunk in rest.chunks(usize::from(split).max(1)) {
        match token.feed(chunk) {
            Ok(frames) => {
                for frame in frames {
                    assert!(frame.len() <= 4096);
                }
            }
            Err(_) => token.reset(),
        }
    }
});
