//! Password strength checks following the NIST SP 800-63B guidelines
//! (section 5.1.1): minimum length, no context-specific names, no
//! compromised or dictionary words, no repetitive or sequential strings.

/// A problem found with a candidate password.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordIssue {
    /// The password has fewer than eight characters.
    TooShort,
    /// The password equals one of the caller-supplied names (e.g. the
    /// service name or the user's email address).
    IsAName,
    /// The password appears in a list of compromised passwords.
    Compromised,
    /// The password appears in a dictionary.
    InDictionary,
    /// The password is one repeated character.
    Repetitive,
    /// The password is a simple keyboard or alphabet sequence.
    Sequential,
}

/// The word lists consulted by [`password_strength`]. The built-in default
/// (see [`PasswordLists::default`]) covers only the most common compromised
/// passwords; services should install fuller lists, e.g. the "Have I Been
/// Pwned" corpus and a dictionary of their users' languages.
#[derive(Debug, Clone)]
pub struct PasswordLists {
    /// Passwords known to have been compromised, checked verbatim.
    pub compromised: Vec<String>,
    /// Dictionary words, checked verbatim.
    pub dictionary: Vec<String>,
}

impl Default for PasswordLists {
    fn default() -> Self {
        Self {
            compromised: COMMON_PASSWORDS.iter().map(|&word| word.to_string()).collect(),
            dictionary: Vec::new(),
        }
    }
}

/// Keyboard rows and other sequences that make a password guessable when it
/// is a substring of one of them.
const SEQUENCES: &[&str] = &[
    "qwertyuiop",
    "qwertzuiopü",
    "azertyuiop",
    "asdfghjklöä",
    "qsdfghjklm",
    "01234567890",
    "abcdefghijklmnopqrstuvwxyz",
];

/// A short head of the most frequently used passwords, all compromised many
/// times over.
const COMMON_PASSWORDS: &[&str] = &[
    "123456", "password", "123456789", "12345678", "12345", "1234567", "qwerty", "abc123",
    "football", "1234567890", "monkey", "letmein", "dragon", "111111", "baseball", "iloveyou",
    "trustno1", "sunshine", "master", "welcome", "shadow", "ashley", "superman", "michael",
    "ninja", "mustang", "jesus", "password1", "password123", "696969", "batman", "buster",
    "access", "hunter2", "hottie", "loveme", "zaq1zaq1", "qazwsx", "starwars", "whatever",
    "princess", "solo", "passw0rd", "flower", "charlie", "jordan", "freedom", "harley",
    "ranger", "aa123456", "donald", "bailey", "jennifer", "secret", "admin", "654321",
    "qwerty123", "1q2w3e4r", "football1", "killer", "soccer", "hockey", "george", "andrew",
    "michelle", "love", "thomas", "pepper", "daniel", "summer",
];

/// Checks the strength of a password against the given word lists and
/// returns the first problem found, or `None` if the password passes.
///
/// `names` should contain the context-specific words the password must not
/// equal, such as the service name and the user's own identifiers; they are
/// compared case-insensitively.
pub fn password_strength(
    password: &str,
    names: &[&str],
    lists: &PasswordLists,
) -> Option<PasswordIssue> {
    if password.chars().count() < 8 {
        return Some(PasswordIssue::TooShort);
    }

    let lowered = password.to_lowercase();
    if names.iter().any(|name| lowered == name.to_lowercase()) {
        return Some(PasswordIssue::IsAName);
    }
    if lists.compromised.iter().any(|word| word == password) {
        return Some(PasswordIssue::Compromised);
    }
    if lists.dictionary.iter().any(|word| word == password) {
        return Some(PasswordIssue::InDictionary);
    }

    let mut characters = password.chars();
    let first = characters.next();
    if characters.all(|ch| Some(ch) == first) {
        return Some(PasswordIssue::Repetitive);
    }

    if SEQUENCES.iter().any(|sequence| sequence.contains(&lowered)) {
        return Some(PasswordIssue::Sequential);
    }

    None
}
