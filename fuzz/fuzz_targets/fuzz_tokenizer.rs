#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = annodex::utils::decode_text(data, usize::MAX) else {
        return;
    };
    let tokenized = annodex::utils::tokenize_str(text);
    let len = text.chars().count() as u32;

    // Tokens are ordered, non-empty and inside the text
    let mut prev_end = 0;
    for token in &tokenized.tokens {
        assert!(token.begin >= prev_end && token.begin < token.end && token.end <= len);
        prev_end = token.end;
    }
});
