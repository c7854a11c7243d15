#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let tokens = beam_core::camera_offset::tokenize(data);
    assert!(tokens.keys().all(|k| !k.is_empty()));
    if let Ok(offset) = beam_core::parse_camera_offset(data) {
        // The serialized form must parse back into an offset.
        let again = beam_core::parse_camera_offset(&offset.to_setting_string());
        assert!(again.is_ok());
    }
});
