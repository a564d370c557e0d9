use std::process::{Command, Output};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, Level};

use crate::default_credentials::TokenProvider;
use crate::types::Token;
use crate::Error;

/// A token provider that shells out to `gcloud auth print-access-token`
#[derive(Debug)]
pub(crate) struct GCloudAuthorizedUser {
    account: String,
}

impl GCloudAuthorizedUser {
    /// Check that `gcloud` runs and has an active account
    pub(crate) fn new() -> Result<Self, Error> {
        let account = run(&["config", "get-value", "account"])?;
        if account.is_empty() {
            return Err(Error::Str("no active `gcloud` account"));
        }

        debug!(account, "found gcloud account");
        Ok(Self { account })
    }
}

#[async_trait]
impl TokenProvider for GCloudAuthorizedUser {
    #[instrument(level = Level::DEBUG, skip(self))]
    async fn token(&self, _scopes: &[&str]) -> Result<Token, Error> {
        debug!(account = self.account, "requesting token from gcloud");
        Ok(Token::from_string(
            run(&["auth", "print-access-token", "--quiet"])?,
            DEFAULT_TOKEN_DURATION,
        ))
    }
}

fn run(cmd: &[&str]) -> Result<String, Error> {
    let mut command = Command::new(GCLOUD_CMD);
    command.args(cmd);

    let output = command
        .output()
        .map_err(|err| Error::Io("failed to run `gcloud`", err))?;
    stdout(output)
}

fn stdout(output: Output) -> Result<String, Error> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        return Err(Error::Gcloud {
            status: output.status,
            stderr,
        });
    }

    let mut stdout = output.stdout;
    while let Some(b' ' | b'\r' | b'\n') = stdout.last() {
        stdout.pop();
    }

    String::from_utf8(stdout).map_err(|_| Error::Str("output from `gcloud` is not UTF-8"))
}

#[cfg(not(target_os = "windows"))]
const GCLOUD_CMD: &str = "gcloud";

#[cfg(target_os = "windows")]
const GCLOUD_CMD: &str = "gcloud.cmd";

/// `gcloud` does not report token expiry; its tokens are valid for one hour
const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(3600);
