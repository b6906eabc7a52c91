//! Best-effort matching of model-produced file names, paths and signatures
//! against the entity table.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::entity_table::Entity;

pub const DEFAULT_SIGNATURE_DISTANCE: usize = 5;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static PUNCTUATION_SPACING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*([(),])\s*").expect("valid regex"));

/// Last path component.
pub fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Lowercased basename with `extension` appended when it is missing.
pub fn normalize_filename(name: &str, extension: &str) -> String {
    let mut normalized = name.trim().to_lowercase();
    let extension = extension.to_lowercase();
    if !normalized.ends_with(&extension) {
        normalized.push_str(&extension);
    }
    basename(&normalized).to_string()
}

pub fn filenames_match(left: &str, right: &str, extension: &str) -> bool {
    normalize_filename(left, extension) == normalize_filename(right, extension)
}

/// Collapses whitespace runs and drops spaces around parentheses and commas,
/// so `foo( a,  b )` and `foo(a,b)` compare equal.
pub fn normalize_signature(signature: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(signature.trim(), " ");
    PUNCTUATION_SPACING_RE
        .replace_all(&collapsed, "$1")
        .into_owned()
}

/// Entity name: the text before the first `(`.
pub fn method_name(signature: &str) -> &str {
    signature
        .split_once('(')
        .map(|(name, _)| name)
        .unwrap_or(signature)
        .trim()
}

/// Damerau-Levenshtein distance between normalized signatures.
pub fn signature_distance(left: &str, right: &str) -> usize {
    strsim::damerau_levenshtein(&normalize_signature(left), &normalize_signature(right))
}

/// Entities whose signature matches `query`. Exact matches after
/// normalization win; otherwise every entity at the minimal distance within
/// `threshold` is returned.
pub fn closest_entities<'a>(query: &str, entities: &'a [Entity], threshold: usize) -> Vec<&'a Entity> {
    let normalized = normalize_signature(query);
    let exact: Vec<&Entity> = entities
        .iter()
        .filter(|entity| normalize_signature(&entity.signature) == normalized)
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    let scored: Vec<(usize, &Entity)> = entities
        .iter()
        .map(|entity| {
            let distance =
                strsim::damerau_levenshtein(&normalized, &normalize_signature(&entity.signature));
            (distance, entity)
        })
        .filter(|(distance, _)| *distance <= threshold)
        .collect();

    let Some(best) = scored.iter().map(|(distance, _)| *distance).min() else {
        return Vec::new();
    };
    scored
        .into_iter()
        .filter(|(distance, _)| *distance == best)
        .map(|(_, entity)| entity)
        .collect()
}

fn path_tokens(path: &str) -> HashSet<String> {
    path.split(['.', '/'])
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of the `.`/`/`-separated lowercase tokens of two paths.
pub fn jaccard_similarity(left: &str, right: &str) -> f64 {
    let left = path_tokens(left);
    let right = path_tokens(right);
    let union = left.union(&right).count();
    if union == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}

/// Candidate most similar to `target`; earlier candidates win ties.
pub fn most_similar_path<'a, I>(target: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(&'a str, f64)> = None;
    for candidate in candidates {
        let score = jaccard_similarity(target, candidate);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(path, _)| path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(signature: &str) -> Entity {
        Entity {
            signature: signature.to_string(),
            body: format!("def {signature}: pass"),
        }
    }

    #[test]
    fn cosmetic_signature_differences_normalize_away() {
        assert_eq!(normalize_signature("foo(a, b)"), normalize_signature("foo(a,b)"));
        assert_eq!(normalize_signature("  foo( a,\n   b )  "), "foo(a,b)");
        assert_eq!(normalize_signature("int  size (int x)"), "int size(int x)");
    }

    #[test]
    fn exact_normalized_match_wins() {
        let entities = vec![entity("foo(a, b)"), entity("foo(a, c)")];
        let matches = closest_entities("foo( a,  b )", &entities, DEFAULT_SIGNATURE_DISTANCE);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].signature, "foo(a, b)");
    }

    #[test]
    fn distance_within_threshold_is_found() {
        let entities = vec![entity("compute(alpha, beta)")];
        assert_eq!(signature_distance("compute(alp, beta)", "compute(alpha, beta)"), 2);
        assert_eq!(signature_distance("compute(al, beta)", "compute(alpha, beta)"), 3);
        let matches = closest_entities("compute(al, beta)", &entities, 5);
        assert_eq!(matches.len(), 1);
    }

    #[test]
    fn distance_beyond_threshold_is_not_found() {
        let entities = vec![entity("compute(alphabet, beta)")];
        assert_eq!(signature_distance("compute(al, beta)", "compute(alphabet, beta)"), 6);
        assert!(closest_entities("compute(al, beta)", &entities, 5).is_empty());
    }

    #[test]
    fn ties_at_minimal_distance_return_all() {
        let entities = vec![entity("load(x)"), entity("load(y)"), entity("loads(xy)")];
        let matches = closest_entities("load(z)", &entities, 5);
        let signatures: Vec<&str> = matches.iter().map(|e| e.signature.as_str()).collect();
        assert_eq!(signatures, vec!["load(x)", "load(y)"]);
    }

    #[test]
    fn method_names_stop_at_the_parameter_list() {
        assert_eq!(method_name("  render (self, width)"), "render");
        assert_eq!(method_name("render"), "render");
    }

    #[test]
    fn filenames_compare_case_and_extension_insensitively() {
        assert!(filenames_match("Parser", "src/pkg/parser.py", ".py"));
        assert!(filenames_match("pkg/PARSER.py", "parser.py", ".py"));
        assert!(!filenames_match("parse", "parser.py", ".py"));
        assert_eq!(normalize_filename("org/Foo.java", ".java"), "foo.java");
    }

    #[test]
    fn jaccard_prefers_paths_sharing_more_tokens() {
        assert_eq!(jaccard_similarity("a/b.py", "a/b.py"), 1.0);
        assert_eq!(jaccard_similarity("", ""), 0.0);
        let best = most_similar_path(
            "django/db/models/query.py",
            ["tests/query.py", "django/db/models/query.py", "django/query.py"],
        );
        assert_eq!(best, Some("django/db/models/query.py"));
    }
}
