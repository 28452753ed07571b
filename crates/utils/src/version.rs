use std::sync::LazyLock;

/// Semantic version of this CSE build, as stamped on the vCD extension.
pub const CSE_VERSION: &str = env!("CSE_BUILD_VERSION");

/// Defines the human readable application version.
pub static VERSION: LazyLock<String> = LazyLock::new(|| {
    let sha = option_env!("VERGEN_GIT_SHA").unwrap_or("unknown");
    let dirty = matches!(option_env!("VERGEN_GIT_DIRTY"), Some("true"));
    format!(
        "{}-{}{}",
        CSE_VERSION,
        sha,
        if dirty { "-dirty" } else { "" }
    )
});
