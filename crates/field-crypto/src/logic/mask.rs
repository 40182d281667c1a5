use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskOptions {
    pub visible_prefix: usize,
    pub visible_suffix: usize,
    pub mask_char: char,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            visible_prefix: 3,
            visible_suffix: 4,
            mask_char: '*',
        }
    }
}

/// Masks the middle of `value`, keeping the configured prefix and suffix.
/// Values too short to keep anything are masked entirely. Masking is a
/// display transform and offers no confidentiality.
pub fn mask_value(value: &str, options: &MaskOptions) -> String {
    let chars: Vec<char> = value.chars().collect();
    let visible = options.visible_prefix + options.visible_suffix;
    if chars.len() <= visible {
        return options.mask_char.to_string().repeat(chars.len());
    }

    let hidden = chars.len() - visible;
    let mut out = String::with_capacity(value.len());
    out.extend(&chars[..options.visible_prefix]);
    out.extend(std::iter::repeat_n(options.mask_char, hidden));
    out.extend(&chars[chars.len() - options.visible_suffix..]);
    out
}

/// Canonical phone form used for lookup hashes: digits only, with a single
/// leading `+` preserved for international numbers.
pub fn normalize_phone_for_hash(value: &str) -> String {
    let trimmed = value.trim();
    let mut out = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        out.push('+');
    }
    out.extend(trimmed.chars().filter(char::is_ascii_digit));
    out
}
