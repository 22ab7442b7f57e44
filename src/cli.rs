use clap::Parser;

/// link checker cli
#[derive(Parser)]
#[command(name = "link-checker")]
#[command(about = "Continuous target-URL checker for a persistent identifier service")]
#[command(version)]
pub struct Cli {
    /// Exclusion file: one `username permanent|temporary` entry per line
    pub exclusion_file: Option<String>,
}

impl Cli {
    /// parse args
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclusion_file_is_optional() {
        let cli = Cli::try_parse_from(["link-checker"]).unwrap();
        assert!(cli.exclusion_file.is_none());

        let cli = Cli::try_parse_from(["link-checker", "/etc/exclusions"]).unwrap();
        assert_eq!(cli.exclusion_file.as_deref(), Some("/etc/exclusions"));
    }

    #[test]
    fn test_extra_arguments_are_rejected() {
        assert!(Cli::try_parse_from(["link-checker", "a", "b"]).is_err());
    }
}
