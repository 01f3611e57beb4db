//! OPK configuration file handling
//!
//! The OpenPubKey CLI reads `config.yml` from `$DATA_DIR/.opk/`. The
//! server never parses provider details itself; it only enforces the
//! start precondition: at least one uncommented provider entry and a
//! `redirect_uris` list. When the file is missing a commented template is
//! generated for the operator to fill in.

use std::io;
use std::path::{Path, PathBuf};

/// Template written on first use. Everything is commented out so the CLI
/// refuses to run until the operator makes a deliberate choice.
const CONFIG_TEMPLATE: &str = "\
# OpenPubKey SSH configuration
#
# Uncomment one provider block and fill in your client id, then uncomment
# the redirect_uris list. The CLI binds the listed localhost ports for the
# OAuth callback.
#
# providers:
#   - alias: google
#     issuer: https://accounts.google.com
#     client_id: <your-client-id>.apps.googleusercontent.com
#     scopes: openid email profile
#
#   - alias: microsoft
#     issuer: https://login.microsoftonline.com/9188040d-6c67-4c5b-b112-36a304b66dad/v2.0
#     client_id: <your-client-id>
#     scopes: openid profile email
#
# redirect_uris:
#   - http://localhost:3000/login-callback
#   - http://localhost:10001/login-callback
#   - http://localhost:11110/login-callback
";

/// Outcome of the config precondition check
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigCheck {
    Ok,
    /// No config existed; a template was written at this path
    Missing { template_path: PathBuf },
    Invalid { reason: String },
}

pub fn config_path(opk_dir: &Path) -> PathBuf {
    opk_dir.join("config.yml")
}

/// Check the config precondition, generating the template when absent.
pub fn ensure_config(opk_dir: &Path) -> io::Result<ConfigCheck> {
    let path = config_path(opk_dir);

    if !path.exists() {
        std::fs::create_dir_all(opk_dir)?;
        std::fs::write(&path, CONFIG_TEMPLATE)?;
        return Ok(ConfigCheck::Missing {
            template_path: path,
        });
    }

    let text = std::fs::read_to_string(&path)?;
    Ok(match validate_config_text(&text) {
        Ok(()) => ConfigCheck::Ok,
        Err(reason) => ConfigCheck::Invalid { reason },
    })
}

/// Line-level validation of the YAML document.
///
/// The check is deliberately shallow: "uncommented provider" is a lexical
/// property, and the CLI is the authority on the full schema.
fn validate_config_text(text: &str) -> Result<(), String> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Providers,
        RedirectUris,
    }

    let mut section = Section::None;
    let mut provider_entries = 0usize;
    let mut saw_redirect_uris = false;
    let mut redirect_entries = 0usize;

    for raw in text.lines() {
        let line = raw.trim_end();
        let trimmed = line.trim_start();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // top-level keys start at column zero
        if !line.starts_with(' ') && !line.starts_with('-') {
            section = if trimmed.starts_with("providers:") {
                Section::Providers
            } else if trimmed.starts_with("redirect_uris:") {
                saw_redirect_uris = true;
                Section::RedirectUris
            } else {
                Section::None
            };
            continue;
        }

        if trimmed.starts_with("- ") || trimmed == "-" {
            match section {
                Section::Providers => provider_entries += 1,
                Section::RedirectUris => redirect_entries += 1,
                Section::None => {}
            }
        }
    }

    if provider_entries == 0 {
        return Err("No uncommented provider configured in config.yml".into());
    }
    if !saw_redirect_uris || redirect_entries == 0 {
        return Err("redirect_uris list is missing from config.yml".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const VALID: &str = "\
providers:
  - alias: google
    issuer: https://accounts.google.com
    client_id: abc.apps.googleusercontent.com
    scopes: openid email profile

redirect_uris:
  - http://localhost:3000/login-callback
";

    #[test]
    fn missing_config_writes_template() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".opk");

        match ensure_config(&dir).unwrap() {
            ConfigCheck::Missing { template_path } => {
                assert!(template_path.exists());
                let text = std::fs::read_to_string(template_path).unwrap();
                assert!(text.contains("providers:"));
                assert!(text.contains("redirect_uris:"));
            }
            other => panic!("expected Missing, got {:?}", other),
        }

        // the template itself is all comments: second call is Invalid
        match ensure_config(&dir).unwrap() {
            ConfigCheck::Invalid { reason } => {
                assert!(reason.contains("provider"));
            }
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert_eq!(validate_config_text(VALID), Ok(()));
    }

    #[test]
    fn commented_provider_does_not_count() {
        let text = "\
providers:
#  - alias: google
#    issuer: https://accounts.google.com

redirect_uris:
  - http://localhost:3000/login-callback
";
        assert!(validate_config_text(text)
            .unwrap_err()
            .contains("provider"));
    }

    #[test]
    fn missing_redirect_uris_is_invalid() {
        let text = "\
providers:
  - alias: google
    issuer: https://accounts.google.com
";
        assert!(validate_config_text(text)
            .unwrap_err()
            .contains("redirect_uris"));
    }
}
