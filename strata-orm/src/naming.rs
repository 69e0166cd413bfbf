//! # Naming Module
//!
//! Converts between type names, table names and singular/plural forms.
//!
//! Table names, foreign keys and join tables are all derived through a [`Naming`]
//! implementation so the conventions stay deterministic. [`Inflector`] is the default:
//! English pluralization rules on top of `heck` case conversion.

use heck::{ToSnakeCase, ToUpperCamelCase};

/// Naming transformations used to derive table names and keys from declared identifiers.
pub trait Naming: Send + Sync {
    /// `comment` -> `comments`
    fn pluralize(&self, word: &str) -> String;

    /// `comments` -> `comment`
    fn singularize(&self, word: &str) -> String;

    /// `BlogPost` -> `blog_post`
    fn underscore(&self, name: &str) -> String;

    /// `blog_post` -> `BlogPost`
    fn camelize(&self, name: &str) -> String;

    /// `BlogPost` -> `blog_posts`
    fn tableize(&self, type_name: &str) -> String {
        self.pluralize(&self.underscore(type_name))
    }

    /// `blog_posts` -> `BlogPost`
    fn classify(&self, table_name: &str) -> String {
        self.camelize(&self.singularize(table_name))
    }
}

/// Default English inflector.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inflector;

const IRREGULAR: &[(&str, &str)] = &[
    ("person", "people"),
    ("man", "men"),
    ("woman", "women"),
    ("child", "children"),
    ("mouse", "mice"),
    ("goose", "geese"),
    ("ox", "oxen"),
    ("movie", "movies"),
    ("cookie", "cookies"),
    ("pie", "pies"),
    ("tie", "ties"),
    ("hero", "heroes"),
    ("potato", "potatoes"),
    ("status", "statuses"),
    ("bus", "buses"),
    ("virus", "viruses"),
    ("alias", "aliases"),
    ("analysis", "analyses"),
    ("crisis", "crises"),
    ("axis", "axes"),
];

const UNCOUNTABLE: &[&str] = &["equipment", "information", "rice", "money", "species", "series", "fish", "sheep", "news"];

fn split_last_word(word: &str) -> (&str, &str) {
    match word.rfind('_') {
        Some(pos) => word.split_at(pos + 1),
        None => ("", word),
    }
}

fn is_vowel(c: char) -> bool {
    matches!(c, 'a' | 'e' | 'i' | 'o' | 'u')
}

impl Naming for Inflector {
    fn pluralize(&self, word: &str) -> String {
        let (prefix, last) = split_last_word(word);
        let lower = last.to_ascii_lowercase();

        if lower.is_empty() || UNCOUNTABLE.contains(&lower.as_str()) {
            return word.to_string();
        }
        if let Some((_, plural)) = IRREGULAR.iter().find(|(singular, _)| *singular == lower) {
            return format!("{prefix}{plural}");
        }

        let plural = if lower.ends_with("quiz") {
            format!("{last}zes")
        } else if lower.ends_with('s') || lower.ends_with('x') || lower.ends_with('z') || lower.ends_with("ch") || lower.ends_with("sh") {
            format!("{last}es")
        } else if lower.ends_with('y') && !lower[..lower.len() - 1].ends_with(is_vowel) {
            format!("{}ies", &last[..last.len() - 1])
        } else if lower.ends_with("fe") {
            format!("{}ves", &last[..last.len() - 2])
        } else if lower.ends_with('f') && !lower.ends_with("ff") {
            format!("{}ves", &last[..last.len() - 1])
        } else {
            format!("{last}s")
        };

        format!("{prefix}{plural}")
    }

    fn singularize(&self, word: &str) -> String {
        let (prefix, last) = split_last_word(word);
        let lower = last.to_ascii_lowercase();

        if lower.is_empty() || UNCOUNTABLE.contains(&lower.as_str()) {
            return word.to_string();
        }
        if let Some((singular, _)) = IRREGULAR.iter().find(|(_, plural)| *plural == lower) {
            return format!("{prefix}{singular}");
        }

        let singular = if lower.ends_with("quizzes") {
            last[..last.len() - 3].to_string()
        } else if lower.ends_with("ies") && lower.len() > 3 {
            format!("{}y", &last[..last.len() - 3])
        } else if lower.ends_with("ives") {
            format!("{}fe", &last[..last.len() - 3])
        } else if lower.ends_with("ves") {
            format!("{}f", &last[..last.len() - 3])
        } else if lower.ends_with("sses") || lower.ends_with("xes") || lower.ends_with("zes") || lower.ends_with("ches") || lower.ends_with("shes") {
            last[..last.len() - 2].to_string()
        } else if lower.ends_with("ss") || lower.ends_with("us") || lower.ends_with("is") {
            last.to_string()
        } else if lower.ends_with('s') {
            last[..last.len() - 1].to_string()
        } else {
            last.to_string()
        };

        format!("{prefix}{singular}")
    }

    fn underscore(&self, name: &str) -> String {
        name.strip_prefix("r#").unwrap_or(name).to_snake_case()
    }

    fn camelize(&self, name: &str) -> String {
        name.to_upper_camel_case()
    }
}
