//! varnishadm client: version banner and active-VCL queries.

use crate::common::SourceError;
use crate::stats::run_command;

/// Invokes `varnishadm` against either the local instance or an explicit
/// admin address with its secret file.
pub struct AdminClient {
    admin_host: Option<String>,
    secrets_file: String,
}

impl AdminClient {
    pub fn new(admin_host: Option<String>, secrets_file: impl Into<String>) -> Self {
        AdminClient {
            admin_host,
            secrets_file: secrets_file.into(),
        }
    }

    async fn run(&self, subcommand: &str) -> Result<String, SourceError> {
        let mut args: Vec<&str> = Vec::with_capacity(5);
        if let Some(host) = &self.admin_host {
            args.extend(["-T", host, "-S", &self.secrets_file]);
        }
        args.push(subcommand);
        run_command("varnishadm", &args).await
    }

    /// The running Varnish release, e.g. `varnish-6.0.12`.
    pub async fn banner_version(&self) -> Result<String, SourceError> {
        let output = self.run("banner").await?;
        parse_banner_version(&output)
            .ok_or_else(|| SourceError::Schema("no release line in varnishadm banner".to_string()))
    }

    /// The currently active VCL name, if `vcl.list` reports one.
    pub async fn active_vcl(&self) -> Result<Option<String>, SourceError> {
        let output = self.run("vcl.list").await?;
        Ok(parse_active_vcl(&output))
    }
}

/// The banner's release line starts with `varnish`; its first field is the
/// version token.
pub fn parse_banner_version(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.starts_with("varnish"))
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// `vcl.list` marks the active configuration with a line starting with
/// `active`; the name is the 5th whitespace field, or the 4th on the
/// Enterprise flavor.
pub fn parse_active_vcl(output: &str) -> Option<String> {
    for line in output.lines() {
        if !line.starts_with("active") {
            continue;
        }
        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() >= 5 {
            return Some(columns[4].to_string());
        }
        if columns.len() >= 4 {
            return Some(columns[3].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_version_is_first_field_of_release_line() {
        let output = concat!(
            "-----------------------------\n",
            "Varnish Cache CLI 1.0\n",
            "-----------------------------\n",
            "varnish-6.0.12 revision 8df8e8b\n",
            "\n",
            "Type 'help' for command list.\n",
        );
        assert_eq!(
            parse_banner_version(output).as_deref(),
            Some("varnish-6.0.12")
        );
    }

    #[test]
    fn banner_without_release_line_yields_none() {
        assert_eq!(parse_banner_version("Type 'help' for command list.\n"), None);
    }

    #[test]
    fn active_vcl_from_five_column_listing() {
        let output = concat!(
            "available  auto    warm         0    boot\n",
            "active     auto    warm         9    vcl-20240101\n",
        );
        assert_eq!(parse_active_vcl(output).as_deref(), Some("vcl-20240101"));
    }

    #[test]
    fn active_vcl_from_enterprise_four_column_listing() {
        let output = "active  warm  9  vcl-ent-01\n";
        assert_eq!(parse_active_vcl(output).as_deref(), Some("vcl-ent-01"));
    }

    #[test]
    fn listing_without_active_line_yields_none() {
        let output = "available  auto  warm  0  boot\n";
        assert_eq!(parse_active_vcl(output), None);
    }
}
