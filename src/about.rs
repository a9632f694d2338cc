pub const SNPGENIE_DISPLAY_VERSION: &str = env!("SNPGENIE_DISPLAY_VERSION");
pub const SNPGENIE_BUILD_N: &str = env!("SNPGENIE_BUILD_N");

pub fn version_cli_text() -> String {
    format!(
        "snpgenie {}\nBuild {}\nVariant calling and SNP alignments from NGS reads",
        SNPGENIE_DISPLAY_VERSION, SNPGENIE_BUILD_N
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_text_mentions_version() {
        let text = version_cli_text();
        assert!(text.starts_with("snpgenie "));
        assert!(text.contains(SNPGENIE_DISPLAY_VERSION));
    }
}
