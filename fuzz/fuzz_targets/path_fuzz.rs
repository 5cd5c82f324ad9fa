#![no_main]
use holefs::modules::constants::MAX_PATH;
use holefs::modules::path::PathResolver;
use libfuzzer_sys::fuzz_target;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fuzz_target!(|data: &[u8]| {
    let resolver = PathResolver::new("/tmp/fuzz_root");
    let virtual_path = Path::new(OsStr::from_bytes(data));

    // Resolution either fits the bound and keeps the root, or refuses
    if let Ok(backing) = resolver.resolve(virtual_path) {
        assert!(backing.as_os_str().len() < MAX_PATH);
        assert!(backing.as_os_str().as_bytes().starts_with(b"/tmp/fuzz_root"));
    }
});
