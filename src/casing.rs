//! Naming-convention casing policies for read-model namespaces.
//!
//! A read-model client factory declares the casing its datastore expects
//! (a search index may want kebab-case, a SQL store snake_case). The
//! framework applies the policy to the read model's name before appending
//! the namespace hash.

/// A target casing for read-model namespace names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasingPolicy {
    /// `camelCaseNames`
    Camel,
    /// `snake_case_names`
    Snake,
    /// `SCREAMING_SNAKE_CASE_NAMES`
    ScreamingSnake,
    /// `PascalCaseNames`
    Pascal,
    /// `Title Case Names`
    Title,
    /// `Sentence case names`
    Sentence,
    /// `kebab-case-names`
    Kebab,
}

impl CasingPolicy {
    /// Re-case `name` according to this policy.
    ///
    /// The input is split into words on `-`, `_`, and whitespace runs, on
    /// lowercase→uppercase and lowercase→digit boundaries, and on
    /// uppercase→capitalized-word boundaries (`HTTPServer` splits as
    /// `HTTP` + `Server`). Words are lowercased and reassembled per the
    /// target casing.
    pub fn apply(&self, name: &str) -> String {
        let words = split_words(name);
        match self {
            CasingPolicy::Camel => words
                .iter()
                .enumerate()
                .map(|(i, w)| if i == 0 { w.clone() } else { capitalize(w) })
                .collect(),
            CasingPolicy::Snake => words.join("_"),
            CasingPolicy::ScreamingSnake => words
                .iter()
                .map(|w| w.to_uppercase())
                .collect::<Vec<_>>()
                .join("_"),
            CasingPolicy::Pascal => words.iter().map(|w| capitalize(w)).collect(),
            CasingPolicy::Title => words
                .iter()
                .map(|w| capitalize(w))
                .collect::<Vec<_>>()
                .join(" "),
            CasingPolicy::Sentence => words
                .iter()
                .enumerate()
                .map(|(i, w)| if i == 0 { capitalize(w) } else { w.clone() })
                .collect::<Vec<_>>()
                .join(" "),
            CasingPolicy::Kebab => words.join("-"),
        }
    }
}

/// Split a name into lowercased words.
fn split_words(name: &str) -> Vec<String> {
    let chars: Vec<char> = name.chars().collect();
    let mut words = Vec::new();
    let mut current = String::new();

    for (i, &c) in chars.iter().enumerate() {
        if c == '-' || c == '_' || c.is_whitespace() {
            flush(&mut current, &mut words);
            continue;
        }

        if !current.is_empty() {
            let prev = chars[i - 1];
            let lower_to_upper = prev.is_lowercase() && c.is_uppercase();
            let lower_to_digit = prev.is_lowercase() && c.is_ascii_digit();
            // "HTTPServer": break between "HTTP" and "Server".
            let acronym_end = prev.is_uppercase()
                && c.is_uppercase()
                && chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            if lower_to_upper || lower_to_digit || acronym_end {
                flush(&mut current, &mut words);
            }
        }

        current.extend(c.to_lowercase());
    }
    flush(&mut current, &mut words);
    words
}

fn flush(current: &mut String, words: &mut Vec<String>) {
    if !current.is_empty() {
        words.push(std::mem::take(current));
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_separators_and_case_boundaries() {
        assert_eq!(split_words("user-profile_view"), ["user", "profile", "view"]);
        assert_eq!(split_words("userProfileView"), ["user", "profile", "view"]);
        assert_eq!(split_words("HTTPServerLog"), ["http", "server", "log"]);
        // Lowercase→digit is a boundary; digits stay attached to what follows.
        assert_eq!(split_words("shard9Index"), ["shard", "9index"]);
    }

    #[test]
    fn applies_each_policy() {
        let name = "user-ProfileHTTP_view";
        assert_eq!(CasingPolicy::Camel.apply(name), "userProfileHttpView");
        assert_eq!(CasingPolicy::Snake.apply(name), "user_profile_http_view");
        assert_eq!(
            CasingPolicy::ScreamingSnake.apply(name),
            "USER_PROFILE_HTTP_VIEW"
        );
        assert_eq!(CasingPolicy::Pascal.apply(name), "UserProfileHttpView");
        assert_eq!(CasingPolicy::Title.apply(name), "User Profile Http View");
        assert_eq!(CasingPolicy::Sentence.apply(name), "User profile http view");
        assert_eq!(CasingPolicy::Kebab.apply(name), "user-profile-http-view");
    }

    #[test]
    fn single_word_is_stable() {
        assert_eq!(CasingPolicy::Snake.apply("orders"), "orders");
        assert_eq!(CasingPolicy::Pascal.apply("orders"), "Orders");
    }

    #[test]
    fn empty_name_yields_empty_string() {
        assert_eq!(CasingPolicy::Kebab.apply(""), "");
        assert_eq!(CasingPolicy::Camel.apply("  "), "");
    }
}
