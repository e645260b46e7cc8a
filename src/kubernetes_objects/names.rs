use sha2::{Digest, Sha256};

const MAX_LABEL_LENGTH: usize = 63;
const MAX_SUBDOMAIN_LENGTH: usize = 253;
const HASH_SUFFIX_LENGTH: usize = 8;

/// Turns `name` into a valid DNS-1123 label.
///
/// Invalid characters become `-`, leading and trailing dashes are trimmed.
/// Names longer than 63 characters are cut and suffixed with a short hash of
/// the full name, so distinct long inputs stay distinct.
pub fn sanitize(name: &str) -> String {
    sanitize_with(&name.to_ascii_lowercase(), name, MAX_LABEL_LENGTH, |c| {
        c.is_ascii_alphanumeric() || c == '-'
    })
}

/// Like [`sanitize`], but keeps dots and allows up to 253 characters.
pub fn sanitize_subdomain(name: &str) -> String {
    sanitize_with(&name.to_ascii_lowercase(), name, MAX_SUBDOMAIN_LENGTH, |c| {
        c.is_ascii_alphanumeric() || c == '-' || c == '.'
    })
}

/// Turns `value` into a valid label value, keeping case, `_` and `.`.
pub fn sanitize_label_value(value: &str) -> String {
    sanitize_with(value, value, MAX_LABEL_LENGTH, |c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
    })
}

/// Deterministic name of the child job of an errand
pub fn job_name(errand_name: &str) -> String {
    sanitize(&format!("{errand_name}-job"))
}

/// Name of the emptyDir volume shared between a container and the output sidecar
pub fn output_volume_name(container_name: &str) -> String {
    sanitize(&format!("output-{container_name}"))
}

/// `input` is cleaned, `original` feeds the truncation hash.
fn sanitize_with(
    input: &str,
    original: &str,
    max_length: usize,
    allowed: impl Fn(char) -> bool,
) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| if allowed(c) { c } else { '-' })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| !c.is_ascii_alphanumeric());

    if cleaned.len() <= max_length {
        return cleaned.to_string();
    }

    let digest = format!("{:x}", Sha256::digest(original.as_bytes()));
    let keep = max_length - HASH_SUFFIX_LENGTH - 1;
    let head = cleaned[..keep].trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
    format!("{head}-{}", &digest[..HASH_SUFFIX_LENGTH])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_replaces_invalid_characters() {
        assert_eq!(sanitize("My_Container.1"), "my-container-1");
        assert_eq!(sanitize("--edge--"), "edge");
        assert_eq!(sanitize_subdomain("Foo_Bar.baz"), "foo-bar.baz");
    }

    #[test]
    fn test_sanitize_label_value_keeps_case() {
        assert_eq!(sanitize_label_value("Demo_App.v2"), "Demo_App.v2");
        assert_eq!(sanitize_label_value("my app!"), "my-app");
        assert_eq!(sanitize_label_value("_x_"), "x");
        assert_eq!(sanitize_label_value(&"B".repeat(80)).len(), 63);
    }

    #[test]
    fn test_sanitize_truncates_long_names_deterministically() {
        let long = "a".repeat(100);
        let first = sanitize(&long);
        assert_eq!(first.len(), 63);
        assert_eq!(first, sanitize(&long));
        assert_ne!(first, sanitize(&format!("{long}b")));
    }

    #[test]
    fn test_job_and_volume_names() {
        assert_eq!(job_name("generate"), "generate-job");
        assert_eq!(output_volume_name("busybox"), "output-busybox");
        assert!(job_name(&"x".repeat(80)).len() <= 63);
    }
}
