use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::warn;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};

use iap_jwt::{
    decode_unverified, verify_iap_jwt, Error, IamCredentialsSigner, IapAudience, KeyFileSigner,
};

/// Mint service account JWTs for calling resources behind Identity-Aware Proxy
#[derive(Debug, clap::Parser)]
#[clap(version)]
struct IapJwtCli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Sign through the IAM Credentials API with the ambient credentials of this process
    Sign {
        /// Email of the service account to sign for
        #[clap(long)]
        service_account: String,
        /// URL of the IAP-protected resource
        #[clap(long)]
        audience: String,
        /// Delegate service accounts, in chain order
        #[clap(long = "delegate")]
        delegates: Vec<String>,
    },
    /// Sign locally with the private key from a service account key file
    SignKeyFile {
        /// Path to the JSON key file of the service account
        #[clap(long, env = "GOOGLE_APPLICATION_CREDENTIALS")]
        key_file: PathBuf,
        /// URL of the IAP-protected resource
        #[clap(long)]
        audience: String,
    },
    /// Print the header and claims of a JWT without verifying its signature
    Inspect { token: String },
    /// Verify a JWT issued by IAP and print its claims
    #[clap(group(clap::ArgGroup::new("backend").args(["project_id", "backend_service_id"])))]
    Verify {
        /// Contents of the `x-goog-iap-jwt-assertion` header
        token: String,
        /// Project number of the backend, to check the audience
        #[clap(long, requires = "backend")]
        project_number: Option<String>,
        /// Project ID of an App Engine backend
        #[clap(long, requires = "project_number")]
        project_id: Option<String>,
        /// ID of a Compute Engine backend service
        #[clap(long, requires = "project_number")]
        backend_service_id: Option<String>,
    },
    /// Print the audience of the JWTs IAP forwards to a backend
    #[clap(subcommand)]
    Audience(AudienceKind),
}

#[derive(Debug, clap::Subcommand)]
enum AudienceKind {
    /// Audience for an App Engine application
    AppEngine {
        /// Numeric project number
        #[clap(long)]
        project_number: String,
        /// Project ID, which is also the application ID
        #[clap(long)]
        project_id: String,
    },
    /// Audience for a backend service behind an HTTP(S) load balancer
    ComputeEngine {
        /// Numeric project number
        #[clap(long)]
        project_number: String,
        /// Numeric ID of the backend service
        #[clap(long)]
        backend_service_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = IapJwtCli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match execute(cli.command).await {
        Ok(output) => {
            println!("{output}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn execute(command: Command) -> Result<String, Error> {
    Ok(match command {
        Command::Sign {
            service_account,
            audience,
            delegates,
        } => IamCredentialsSigner::new()
            .await?
            .with_delegates(delegates)
            .sign(&service_account, &audience)
            .await?
            .into_string(),
        Command::SignKeyFile { key_file, audience } => KeyFileSigner::from_file(&key_file)?
            .sign(&audience)?
            .into_string(),
        Command::Inspect { token } => {
            let (header, claims) = decode_unverified(&token)?;
            let decoded = serde_json::json!({ "header": header, "claims": claims });
            serde_json::to_string_pretty(&decoded)
                .map_err(|err| Error::Json("failed to serialize decoded JWT", err))?
        }
        Command::Verify {
            token,
            project_number,
            project_id,
            backend_service_id,
        } => {
            let audience = match (project_number, project_id, backend_service_id) {
                (Some(number), Some(id), _) => Some(IapAudience::app_engine(number, id)),
                (Some(number), None, Some(id)) => Some(IapAudience::compute_engine(number, id)),
                _ => {
                    warn!("audience not checked, pass --project-number to check it");
                    None
                }
            };

            let claims = verify_iap_jwt(&token, audience.as_ref()).await?;
            serde_json::to_string_pretty(&claims)
                .map_err(|err| Error::Json("failed to serialize verified claims", err))?
        }
        Command::Audience(AudienceKind::AppEngine {
            project_number,
            project_id,
        }) => IapAudience::app_engine(project_number, project_id).to_string(),
        Command::Audience(AudienceKind::ComputeEngine {
            project_number,
            backend_service_id,
        }) => IapAudience::compute_engine(project_number, backend_service_id).to_string(),
    })
}
