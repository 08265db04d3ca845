use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use certfleet::{
    load_desired_state, specs_from_desired, Action, CertFleetConfig, CertificateSpec,
    Dns01Client, OutcomeAction, Zone, ZoneSet,
};
use clap::Parser;
use documented::DocumentedFields;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use toml_edit::ser::to_document;
use tracing::{error, info, warn};

#[derive(Parser)]
enum Command {
    /// Issue or renew every certificate that needs it, then exit
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "certfleet.toml")]
        config: PathBuf,
    },
    /// Validate the desired certificates and show what a run would do
    Check {
        /// Path to the configuration file
        #[arg(short, long, default_value = "certfleet.toml")]
        config: PathBuf,
    },
    /// Create the ACME account if it does not exist yet
    Init {
        /// Path to the configuration file
        #[arg(short, long, default_value = "certfleet.toml")]
        config: PathBuf,
    },
    /// Generate configuration template
    Cfg {
        /// Write to file
        #[arg(short, long)]
        write_to: Option<PathBuf>,
    },
}

#[derive(Parser)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Deserialize, Serialize)]
struct ZoneConfig {
    domain: String,
    provider: Dns01Client,
}

#[derive(Deserialize, Serialize, DocumentedFields)]
struct Config {
    /// Path to the working directory
    workdir: PathBuf,
    /// ACME directory URL, or `staging` / `live` for Let's Encrypt
    acme_server: String,
    /// Contact email for the ACME account
    email: String,
    /// Agree to the ACME server's terms of service
    agree_tos: bool,
    /// JSON file mapping certificate names to their SANs
    certs_file: PathBuf,
    /// Number of days before expiration to trigger renewal
    renew_days_before: u32,
    /// Run timeout in seconds
    run_timeout: u64,
    /// Number of certificates processed at the same time
    concurrency: usize,
    /// Wait for challenge records to show up in DNS before requesting validation
    check_dns: bool,
    /// Command to run after a certificate was issued or renewed.
    /// It receives the certificate name as its only argument.
    #[serde(default)]
    hook: Option<String>,
    /// DNS zones and the providers managing them
    zones: Vec<ZoneConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workdir: ".".into(),
            acme_server: "staging".into(),
            email: "".into(),
            agree_tos: false,
            certs_file: "certs.json".into(),
            renew_days_before: 15,
            run_timeout: 3600,
            concurrency: 4,
            check_dns: true,
            hook: None,
            zones: vec![ZoneConfig {
                domain: "example.com".into(),
                provider: Dns01Client::new_cloudflare("".into(), "".into()),
            }],
        }
    }
}

impl Config {
    fn load(path: &PathBuf) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        toml_edit::de::from_str(&content).context("invalid configuration")
    }

    fn to_commented_toml(&self) -> Result<String> {
        let mut doc = to_document(self)?;

        for (mut key, _value) in doc.iter_mut() {
            let Ok(docstring) = Self::get_field_docs(key.get()) else {
                continue;
            };
            let decor = key.leaf_decor_mut();

            let mut comment = String::new();
            for line in docstring.lines() {
                let line = if line.is_empty() {
                    String::from("#\n")
                } else {
                    format!("# {line}\n")
                };
                comment.push_str(&line);
            }
            decor.set_prefix(comment);
        }
        Ok(doc.to_string())
    }

    fn fleet_config(&self) -> CertFleetConfig {
        CertFleetConfig::builder()
            .acme_url(self.acme_server.clone())
            .email(self.email.clone())
            .agree_tos(self.agree_tos)
            .auto_create_account(true)
            .workdir(self.workdir.clone())
            .renewal_window_days(self.renew_days_before)
            .run_timeout(Duration::from_secs(self.run_timeout))
            .concurrency(self.concurrency)
            .check_dns(self.check_dns)
            .maybe_renewed_hook(self.hook.clone())
            .build()
    }

    fn zones(&self) -> ZoneSet {
        self.zones
            .iter()
            .map(|zone| Zone::new(zone.domain.clone(), zone.provider.clone()))
            .collect()
    }

    fn specs(&self) -> Result<BTreeMap<String, CertificateSpec>> {
        let desired = load_desired_state(&self.certs_file).with_context(|| {
            format!(
                "failed to load desired certificates from {}",
                self.certs_file.display()
            )
        })?;
        Ok(specs_from_desired(desired))
    }
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::Skip => "skip",
        Action::Issue => "issue",
        Action::Renew => "renew",
    }
}

async fn run(config: &PathBuf) -> Result<()> {
    let config = Config::load(config).context("Failed to load configuration")?;
    let specs = config.specs()?;
    let fleet = config
        .fleet_config()
        .build_fleet(config.zones())
        .await
        .context("Failed to build certfleet")?;
    let report = fleet.run(&specs).await?;
    for outcome in report.outcomes() {
        match (&outcome.error, &outcome.warning) {
            (Some(err), _) => error!(cert = %outcome.name, "{}: {err:#}", outcome.action),
            (None, Some(warning)) => {
                warn!(cert = %outcome.name, "{} with warning: {warning}", outcome.action)
            }
            (None, None) => info!(cert = %outcome.name, "{}", outcome.action),
        }
    }
    println!("{report}");
    if report.has_failures() {
        bail!(
            "{} certificate(s) failed",
            report.count(OutcomeAction::Failed)
        );
    }
    Ok(())
}

fn check(config: &PathBuf) -> Result<()> {
    let config = Config::load(config).context("Failed to load configuration")?;
    let specs = config.specs()?;
    let plan = config.fleet_config().check(&config.zones(), &specs)?;
    for (name, action) in plan {
        println!("{name}: {}", action_name(action));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install default crypto provider");

    let args = Args::parse();
    match args.command {
        Command::Run { config } => {
            run(&config).await?;
        }
        Command::Check { config } => {
            check(&config)?;
        }
        Command::Init { config } => {
            let config = Config::load(&config).context("Failed to load configuration")?;
            // Building the fleet creates the account when there is none yet
            let fleet = config
                .fleet_config()
                .build_fleet(config.zones())
                .await
                .context("Failed to build certfleet")?;
            println!("ACME account: {}", fleet.account_id());
        }
        Command::Cfg { write_to } => {
            let toml_str = Config::default().to_commented_toml()?;
            match write_to {
                Some(path) => fs::write(path, toml_str)?,
                None => println!("{}", toml_str),
            }
        }
    }
    Ok(())
}
