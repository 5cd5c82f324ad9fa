#![no_main]
use arbitrary::Arbitrary;
use holefs::{CodecSpec, Mode};
use libfuzzer_sys::fuzz_target;
use std::path::PathBuf;

#[derive(Debug, Arbitrary)]
struct Input {
    profile: String,
    backing: String,
    recipient: Option<String>,
    ingest: bool,
}

fuzz_target!(|input: Input| {
    // Try to parse as codec profile
    if let Ok(spec) = CodecSpec::from_json(&input.profile) {
        let mode = if input.ingest { Mode::Ingest } else { Mode::Egress };
        let backing = PathBuf::from(&input.backing);
        if let Ok(argv) = spec.argv(mode, &backing, input.recipient.as_deref()) {
            assert!(!argv.is_empty());
            assert_eq!(argv[0].as_bytes(), spec.program.as_bytes());
        }
    }
});
