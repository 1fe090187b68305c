//! Text normalization applied before synthesis

/// Clamp range for the internal speed factor
const MIN_SPEED: f32 = 0.5;
const MAX_SPEED: f32 = 2.0;

/// Map the wire `speech_rate` (-500 slowest .. 0 normal .. 500 fastest)
/// to the backend speed factor (0.5 .. 1.0 .. 2.0), linearly, clamped.
pub fn speech_rate_to_speed(speech_rate: i32) -> f32 {
    if speech_rate == 0 {
        return 1.0;
    }
    let speed = 1.0 + (speech_rate as f32 / 500.0);
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

/// Trim, collapse whitespace runs, and drop control characters the
/// backends cannot voice. Punctuation and all scripts are kept.
pub fn clean_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;

    for c in text.trim().chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else if !c.is_control() {
            out.push(c);
            last_was_space = false;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_mapping_endpoints() {
        assert_eq!(speech_rate_to_speed(0), 1.0);
        assert_eq!(speech_rate_to_speed(-500), 0.5);
        assert_eq!(speech_rate_to_speed(500), 2.0);
    }

    #[test]
    fn test_speed_mapping_clamps() {
        // Out-of-range inputs are rejected at validation, but the mapping
        // itself stays within bounds regardless.
        assert_eq!(speech_rate_to_speed(-1000), 0.5);
        assert_eq!(speech_rate_to_speed(1000), 2.0);
    }

    #[test]
    fn test_clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  hello   world \n"), "hello world");
    }

    #[test]
    fn test_clean_text_keeps_cjk_and_punctuation() {
        assert_eq!(clean_text("你好，世界！ ok?"), "你好，世界！ ok?");
    }

    #[test]
    fn test_clean_text_strips_control_chars() {
        assert_eq!(clean_text("a\u{0000}b\u{0007}c"), "abc");
    }
}
