//! Phonetic encodings for fuzzy name search
//!
//! Encoded values are stored next to the name components of subjects and
//! requesting physicians. They only feed fuzzy matching queries; identity
//! decisions never look at them.

/// Phonetic encoder applied to a single name component
pub trait FuzzyStr: Send + Sync {
    /// Encode one name component; multi-word components encode word by word
    fn to_fuzzy(&self, s: &str) -> String;
}

/// Soundex digit for a letter; `None` for vowels and the separators H/W/Y
fn soundex_code(c: char) -> Option<char> {
    match c {
        'B' | 'F' | 'P' | 'V' => Some('1'),
        'C' | 'G' | 'J' | 'K' | 'Q' | 'S' | 'X' | 'Z' => Some('2'),
        'D' | 'T' => Some('3'),
        'L' => Some('4'),
        'M' | 'N' => Some('5'),
        'R' => Some('6'),
        _ => None,
    }
}

/// Encode one word; `max_len` of `None` keeps every code digit
fn encode_word(word: &str, max_len: Option<usize>, pad: bool) -> String {
    let letters: Vec<char> = word
        .chars()
        .filter(|c| c.is_ascii_alphabetic())
        .map(|c| c.to_ascii_uppercase())
        .collect();

    let Some(&first) = letters.first() else {
        return String::new();
    };

    let mut out = String::new();
    out.push(first);
    let mut last = soundex_code(first);

    for &c in &letters[1..] {
        if max_len.is_some_and(|max| out.len() >= max) {
            break;
        }
        let code = soundex_code(c);
        match code {
            Some(digit) if code != last => out.push(digit),
            Some(_) => {}
            // H and W do not separate equal codes, vowels do
            None if c == 'H' || c == 'W' => continue,
            None => {}
        }
        last = code;
    }

    if pad {
        if let Some(max) = max_len {
            while out.len() < max {
                out.push('0');
            }
        }
    }
    out
}

fn encode_words(s: &str, max_len: Option<usize>, pad: bool) -> String {
    s.split(|c: char| c.is_whitespace() || c == '-')
        .map(|w| encode_word(w, max_len, pad))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classic four-character Soundex (`Robert` → `R163`)
#[derive(Debug, Clone, Copy, Default)]
pub struct Soundex;

impl FuzzyStr for Soundex {
    fn to_fuzzy(&self, s: &str) -> String {
        encode_words(s, Some(4), true)
    }
}

/// Soundex without the length limit, so long names keep their tail
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtendedSoundex;

impl FuzzyStr for ExtendedSoundex {
    fn to_fuzzy(&self, s: &str) -> String {
        encode_words(s, None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soundex_reference_values() {
        let s = Soundex;
        assert_eq!(s.to_fuzzy("Robert"), "R163");
        assert_eq!(s.to_fuzzy("Rupert"), "R163");
        assert_eq!(s.to_fuzzy("Tymczak"), "T522");
        assert_eq!(s.to_fuzzy("Pfister"), "P236");
        assert_eq!(s.to_fuzzy("Ashcraft"), "A261");
        assert_eq!(s.to_fuzzy("Lee"), "L000");
    }

    #[test]
    fn test_extended_soundex_keeps_tail() {
        let e = ExtendedSoundex;
        assert_eq!(e.to_fuzzy("Robert"), "R163");
        assert_eq!(e.to_fuzzy("Washington"), "W25235");
        assert_eq!(e.to_fuzzy("Lee"), "L");
    }

    #[test]
    fn test_case_and_punctuation_ignored() {
        let s = Soundex;
        assert_eq!(s.to_fuzzy("o'brien"), s.to_fuzzy("OBRIEN"));
        assert_eq!(s.to_fuzzy(""), "");
        assert_eq!(s.to_fuzzy("123"), "");
    }

    #[test]
    fn test_multi_word_names() {
        assert_eq!(Soundex.to_fuzzy("van Berg"), "V500 B620");
        assert_eq!(Soundex.to_fuzzy("Smith-Jones"), "S530 J520");
    }
}
