// This is adapted from Kubernetes.
// See apimachinery/pkg/util/validation/validation.go in the Kubernetes source

use std::sync::LazyLock;

use const_format::concatcp;
use regex::Regex;

const RFC_1123_LABEL_FMT: &str = "[a-z0-9]([-a-z0-9]*[a-z0-9])?";
const RFC_1123_SUBDOMAIN_FMT: &str =
    concatcp!(RFC_1123_LABEL_FMT, "(\\.", RFC_1123_LABEL_FMT, ")*");
const RFC_1123_SUBDOMAIN_ERROR_MSG: &str = "a lowercase RFC 1123 subdomain must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character";

// This is a subdomain's max length in DNS (RFC 1123)
const RFC_1123_SUBDOMAIN_MAX_LENGTH: usize = 253;

/// The slashed resource type identifier: an API group, a plural resource
/// name, and an optional subresource path, e.g.
/// `resourcemanager.miloapis.com/projects` or `compute.example.com/workloads/cpu`.
const RESOURCE_TYPE_FMT: &str = concatcp!(
    RFC_1123_SUBDOMAIN_FMT,
    "/",
    RFC_1123_LABEL_FMT,
    "(/",
    RFC_1123_LABEL_FMT,
    ")?"
);
const RESOURCE_TYPE_ERROR_MSG: &str = "a resource type must be an API group followed by a slash-separated plural resource name and an optional subresource path";

static RFC_1123_SUBDOMAIN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RFC_1123_SUBDOMAIN_FMT}$"))
        .expect("failed to compile RFC 1123 subdomain regex")
});

static RESOURCE_TYPE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^{RESOURCE_TYPE_FMT}$")).expect("failed to compile resource type regex")
});

/// Returns a formatted error message for maximum length violations.
fn max_len_error(length: usize) -> String {
    format!("must be no more than {length} characters")
}

fn regex_error(msg: &str, fmt: &str, examples: &[&str]) -> String {
    if examples.is_empty() {
        return format!("{msg} (regex used for validation is '{fmt}')");
    }

    let mut msg = msg.to_string();
    msg.push_str(" (e.g. ");
    for (i, example) in examples.iter().enumerate() {
        if i > 0 {
            msg.push_str(" or ");
        }
        msg.push('\'');
        msg.push_str(example);
        msg.push_str("', ");
    }

    msg.push_str("regex used for validation is '");
    msg.push_str(fmt);
    msg.push_str("')");
    msg
}

/// Tests for a string that conforms to the definition of a subdomain in DNS (RFC 1123).
pub fn is_rfc_1123_subdomain(value: &str) -> Result<(), Vec<String>> {
    let mut errors = vec![];
    if value.len() > RFC_1123_SUBDOMAIN_MAX_LENGTH {
        errors.push(max_len_error(RFC_1123_SUBDOMAIN_MAX_LENGTH))
    }

    if !RFC_1123_SUBDOMAIN_REGEX.is_match(value) {
        errors.push(regex_error(
            RFC_1123_SUBDOMAIN_ERROR_MSG,
            RFC_1123_SUBDOMAIN_FMT,
            &["example.com"],
        ))
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Tests for a string that conforms to the slashed resource type format.
pub fn is_resource_type(value: &str) -> Result<(), Vec<String>> {
    let mut errors = vec![];
    if value.len() > RFC_1123_SUBDOMAIN_MAX_LENGTH {
        errors.push(max_len_error(RFC_1123_SUBDOMAIN_MAX_LENGTH))
    }

    if !RESOURCE_TYPE_REGEX.is_match(value) {
        errors.push(regex_error(
            RESOURCE_TYPE_ERROR_MSG,
            RESOURCE_TYPE_FMT,
            &[
                "resourcemanager.miloapis.com/projects",
                "compute.miloapis.com/workloads/cpu",
            ],
        ))
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("resourcemanager.miloapis.com/projects")]
    #[case("compute.miloapis.com/workloads")]
    #[case("compute.miloapis.com/workloads/cpu")]
    #[case("iam.miloapis.com/roles")]
    #[case("apps/deployments")]
    fn good_resource_types(#[case] value: &str) {
        assert!(is_resource_type(value).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("projects")]
    #[case("/projects")]
    #[case("resourcemanager.miloapis.com/")]
    #[case("resourcemanager.miloapis.com/Projects")]
    #[case("resourcemanager.miloapis.com/projects/")]
    #[case("resourcemanager.miloapis.com/projects/cpu/extra")]
    #[case("UPPER.example.com/projects")]
    #[case("resourcemanager.miloapis.com/pro jects")]
    fn bad_resource_types(#[case] value: &str) {
        assert!(is_resource_type(value).is_err());
    }

    #[rstest]
    #[case("a")]
    #[case("example.com")]
    #[case(&"a".repeat(253))]
    fn good_subdomains(#[case] value: &str) {
        assert!(is_rfc_1123_subdomain(value).is_ok());
    }

    #[rstest]
    #[case("")]
    #[case("A")]
    #[case("a..b")]
    #[case("-a")]
    #[case(&"a".repeat(254))]
    fn bad_subdomains(#[case] value: &str) {
        assert!(is_rfc_1123_subdomain(value).is_err());
    }
}
