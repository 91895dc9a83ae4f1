//! Preview alias derivation.
//!
//! An alias depends only on the repository name and the ref, never on the
//! commit, so every push to a pull request lands on the same hostname.

use sha2::{Digest, Sha256};

/// DNS limits a single label to 63 bytes.
pub const MAX_LABEL_LEN: usize = 63;

const SEPARATOR: char = '-';
const FINGERPRINT_LEN: usize = 7;

/// Lower-case ASCII alphanumerics; every other run of characters becomes one separator.
pub fn sanitize(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with(SEPARATOR) {
            out.push(SEPARATOR);
        }
    }
    out.trim_end_matches(SEPARATOR).to_string()
}

/// The hostname label for `repo` at `git_ref`.
///
/// Refs that sanitize to themselves give `<repo>-<ref>`. Otherwise, or when the
/// label would exceed [`MAX_LABEL_LEN`] or already ends in something shaped like
/// a fingerprint, the label is truncated, stripped of a trailing separator and
/// suffixed with a fingerprint of the raw ref. A readable label therefore never
/// looks like a fingerprinted one.
pub fn alias_label(repo: &str, git_ref: &str) -> String {
    let repo_part = sanitize(repo);
    let ref_part = sanitize(git_ref);

    let mut label = repo_part;
    if !ref_part.is_empty() {
        if !label.is_empty() {
            label.push(SEPARATOR);
        }
        label.push_str(&ref_part);
    }

    let lossy = ref_part != git_ref;
    if !lossy
        && !label.is_empty()
        && label.len() <= MAX_LABEL_LEN
        && !ends_in_fingerprint(&label)
    {
        return label;
    }

    // ASCII only at this point, so byte truncation is char-safe.
    label.truncate(MAX_LABEL_LEN - FINGERPRINT_LEN - 1);
    let head = label.trim_end_matches(SEPARATOR);

    let fingerprint = fingerprint(git_ref);
    if head.is_empty() {
        fingerprint
    } else {
        format!("{}{}{}", head, SEPARATOR, fingerprint)
    }
}

/// Full alias URL, e.g. `https://widgets-feature-x.now.sh`.
pub fn alias_url(repo: &str, git_ref: &str, domain: &str) -> String {
    format!("https://{}.{}", alias_label(repo, git_ref), domain)
}

fn ends_in_fingerprint(label: &str) -> bool {
    let last = label.rsplit(SEPARATOR).next().unwrap_or(label);
    last.len() == FINGERPRINT_LEN && last.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

fn fingerprint(git_ref: &str) -> String {
    let digest = hex::encode(Sha256::digest(git_ref.as_bytes()));
    digest[..FINGERPRINT_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_valid_label(label: &str) {
        assert!(!label.is_empty());
        assert!(label.len() <= MAX_LABEL_LEN, "{} is too long", label);
        assert!(
            label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == SEPARATOR),
            "{} has characters outside the allowed set",
            label
        );
        assert!(!label.starts_with(SEPARATOR), "{} starts with a separator", label);
        assert!(!label.ends_with(SEPARATOR), "{} ends with a separator", label);
    }

    #[test]
    fn plain_ref_keeps_readable_form() {
        assert_eq!(alias_label("widgets", "feature-x"), "widgets-feature-x");
        assert_eq!(
            alias_url("widgets", "feature-x", "now.sh"),
            "https://widgets-feature-x.now.sh"
        );
    }

    #[test]
    fn sanitize_collapses_runs() {
        assert_eq!(sanitize("My__Repo.js"), "my-repo-js");
        assert_eq!(sanitize("--lead/trail--"), "lead-trail");
        assert_eq!(sanitize("///"), "");
    }

    #[test]
    fn deterministic() {
        let a = alias_label("widgets", "feature/Big_Change");
        let b = alias_label("widgets", "feature/Big_Change");
        assert_eq!(a, b);
    }

    #[test]
    fn refs_differing_only_in_punctuation_do_not_collide() {
        let plain = alias_label("widgets", "feature-x");
        let slashed = alias_label("widgets", "feature/x");
        let upper = alias_label("widgets", "Feature-X");
        assert_ne!(plain, slashed);
        assert_ne!(plain, upper);
        assert_ne!(slashed, upper);
        assert!(slashed.starts_with("widgets-feature-x-"));
    }

    #[test]
    fn ref_shaped_like_a_fingerprinted_label_does_not_take_it_over() {
        let slashed = alias_label("widgets", "feature/x");
        let suffix = slashed.rsplit(SEPARATOR).next().unwrap();
        let lookalike = format!("feature-x-{}", suffix);

        let taken = alias_label("widgets", &lookalike);
        assert_ne!(slashed, taken);
        assert_valid_label(&taken);

        // Whole-label fingerprints are covered too.
        assert_ne!(alias_label("___", "--"), alias_label("___", &fingerprint("--")));
    }

    #[test]
    fn hex_looking_segments_of_other_lengths_stay_readable() {
        assert_eq!(alias_label("widgets", "fix-cafe"), "widgets-fix-cafe");
        assert_eq!(alias_label("widgets", "v1-deadbeef0"), "widgets-v1-deadbeef0");
    }

    #[test]
    fn long_names_are_capped_without_dangling_separator() {
        let repo = "a-really-long-repository-name-that-goes-on";
        let git_ref = "and-a-branch-name-that-is-also-far-too-long-for-dns";
        let label = alias_label(repo, git_ref);
        assert_valid_label(&label);

        // Truncation point lands right after a separator.
        let repo = "x".repeat(54);
        let label = alias_label(&format!("{}-", repo), "feature-branch");
        assert_valid_label(&label);
        assert!(!label.contains("--"));
    }

    #[test]
    fn long_refs_sharing_a_prefix_do_not_collide() {
        let base = "b".repeat(80);
        let a = alias_label("widgets", &format!("{}-one", base));
        let b = alias_label("widgets", &format!("{}-two", base));
        assert_ne!(a, b);
    }

    #[test]
    fn labels_are_always_valid() {
        let repos = ["widgets", "My.Repo", "___", "ünïcödé", &"r".repeat(100)];
        let refs = [
            "main",
            "feature/x",
            "release/v1.2.3",
            "--",
            "",
            "UPPER",
            &"q/".repeat(60),
        ];
        for repo in repos {
            for git_ref in refs {
                assert_valid_label(&alias_label(repo, git_ref));
            }
        }
    }
}
