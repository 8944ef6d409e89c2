use std::fmt;

pub struct FormattedSize {
    pub size: f64,
}

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ksize = self.size / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 8f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

impl fmt::Debug for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size: size as f64 }
}

/// Parses `value` as a number with an optional `k`/`m`/`g` suffix (and an optional
/// trailing `b`), returning the number and the suffix multiplier.
fn parse_float_and_factor(value: &str) -> Option<(f64, usize)> {
    let mut value = value.trim();
    if value.is_empty() {
        return None;
    }

    if value.len() > 1 && (value.ends_with('b') || value.ends_with('B')) {
        value = &value[..value.len() - 1];
    }

    let (digits, factor) = match value.as_bytes()[value.len() - 1] {
        b'g' | b'G' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        b'm' | b'M' => (&value[..value.len() - 1], 1024 * 1024),
        b'k' | b'K' => (&value[..value.len() - 1], 1024),
        _ => (value, 1),
    };

    digits.parse::<f64>().ok().map(|x| (x, factor))
}

fn read_float_and_factor_from_env(var: &str) -> Option<(f64, usize)> {
    std::env::var(var)
        .ok()
        .and_then(|value| parse_float_and_factor(&value))
}

pub fn read_uint_from_env(var: &str) -> Option<usize> {
    let (value, factor) = read_float_and_factor_from_env(var)?;

    Some(value as usize * factor)
}

pub fn read_float_from_env(var: &str) -> Option<f64> {
    read_float_and_factor_from_env(var).map(|x| x.0)
}

pub fn read_bool_from_env(var: &str) -> Option<bool> {
    match std::env::var(var).ok()?.trim() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_float_and_factor("12"), Some((12.0, 1)));
        assert_eq!(parse_float_and_factor("4k"), Some((4.0, 1024)));
        assert_eq!(parse_float_and_factor("2MB"), Some((2.0, 1024 * 1024)));
        assert_eq!(parse_float_and_factor("1g"), Some((1.0, 1024 * 1024 * 1024)));
        assert_eq!(parse_float_and_factor(""), None);
        assert_eq!(parse_float_and_factor("abc"), None);
    }

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(4096).to_string(), "4.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }
}
