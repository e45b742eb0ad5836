//! Fuzz testing for request input handling.
//!
//! Feeds arbitrary bytes through the sanitizer and the credential checks.
//! Neither may panic, and sanitizing only ever removes text.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_input -- -max_total_time=60
//! ```

#![no_main]

use std::sync::OnceLock;

use chainsite::middleware::Sanitizer;
use chainsite::validation::validate_credentials;
use libfuzzer_sys::fuzz_target;

fn sanitizer() -> &'static Sanitizer {
    static SANITIZER: OnceLock<Sanitizer> = OnceLock::new();
    SANITIZER.get_or_init(|| Sanitizer::new(10).expect("patterns compile"))
}

fuzz_target!(|data: &[u8]| {
    let sanitizer = sanitizer();

    // Form bodies and query strings
    let _ = sanitizer.clean_urlencoded(data);

    let Ok(s) = std::str::from_utf8(data) else {
        return;
    };

    let cleaned = sanitizer.clean_str(s);
    assert!(cleaned.len() <= s.len());

    // JSON bodies, including nested keys
    if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(s) {
        let _ = sanitizer.clean_value(&mut value);
    }

    // Split the input into a username and password at the first NUL
    let (username, password) = s.split_once('\0').unwrap_or((s, ""));
    let _ = validate_credentials(username, password);
});
