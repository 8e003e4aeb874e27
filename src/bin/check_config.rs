//! CLI tool for inspecting a RustServe configuration file
//!
//! Usage:
//!   rustserve-config check
//!   rustserve-config list [--json]
//!   rustserve-config resolve <host> [path]

use anyhow::Result;
use clap::{Parser, Subcommand};
use rustserve::{
    resolve_host, CertificateCache, DomainConfig, ProxyRegistry, ServerConfig, StaticFiles,
    TracingSink,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Inspect and validate a RustServe configuration
#[derive(Parser, Debug)]
#[command(name = "rustserve-config")]
#[command(author = "RustServe Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Inspect and validate a RustServe configuration")]
struct Args {
    /// Configuration file
    #[arg(long, env = "CONFIG", default_value = "/etc/rustserve.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load every certificate and build every backend proxy
    Check,

    /// List configured domains and backends
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show how a request would be handled
    Resolve {
        /// Host header, e.g. blog.example.com
        host: String,

        /// Request path
        #[arg(default_value = "/")]
        path: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Arc::new(ServerConfig::load(&args.config)?);

    match args.command {
        Commands::Check => {
            let events = Arc::new(TracingSink);
            let certificates = CertificateCache::new(config.clone(), events.clone());
            let proxies = ProxyRegistry::new(events);
            let mut failures = 0;

            for (name, domain) in sorted(&config) {
                match certificates.config_for_client(Some(name.as_str())) {
                    Ok(_) => println!("ok    {}  certificate {}", name, domain.cert_file.display()),
                    Err(e) => {
                        failures += 1;
                        println!("FAIL  {}  {}", name, e);
                    }
                }
                for (label, backend) in &domain.backends {
                    match proxies.handle(backend) {
                        Ok(proxy) => println!("ok    {}.{}  -> {}", label, name, proxy.target()),
                        Err(e) => {
                            failures += 1;
                            println!("FAIL  {}.{}  {}", label, name, e);
                        }
                    }
                }
            }

            if failures > 0 {
                eprintln!("\n{} problem(s) found", failures);
                std::process::exit(1);
            }
            println!("\nConfiguration OK");
        }

        Commands::List { json } => {
            if config.domains.is_empty() {
                println!("No domains configured");
                return Ok(());
            }

            if json {
                let json_output: Vec<serde_json::Value> = sorted(&config)
                    .map(|(name, d)| {
                        let backends: serde_json::Map<String, serde_json::Value> = d
                            .backends
                            .iter()
                            .map(|(label, b)| (label.clone(), serde_json::Value::from(b.target.clone())))
                            .collect();
                        serde_json::json!({
                            "domain": name,
                            "basepath": d.base_path,
                            "default": d.default_subdomain,
                            "subdir": d.subdir,
                            "indexfallback": d.index_fallback,
                            "backends": backends,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json_output)?);
            } else {
                println!("{:<30} {:<12} {:<9} {:<40}", "DOMAIN", "DEFAULT", "FALLBACK", "BASEPATH");
                println!("{}", "-".repeat(94));

                for (name, domain) in sorted(&config) {
                    println!(
                        "{:<30} {:<12} {:<9} {:<40}",
                        name,
                        if domain.default_subdomain.is_empty() { "-" } else { domain.default_subdomain.as_str() },
                        if domain.index_fallback { "yes" } else { "no" },
                        domain.base_path.display()
                    );
                    let mut backends: Vec<_> = domain.backends.iter().collect();
                    backends.sort_by(|a, b| a.0.cmp(b.0));
                    for (label, backend) in backends {
                        println!("    {}.{} -> {}", label, name, backend.target);
                    }
                }

                println!("\nTotal: {} domain(s)", config.domains.len());
            }
        }

        Commands::Resolve { host, path } => {
            let parts = resolve_host(&host)?;
            let Some(domain) = config.domain(&parts.domain) else {
                eprintln!("No such domain in config: {}", parts.domain);
                std::process::exit(1);
            };
            let subdomain = domain.subdomain_or_default(&parts.subdomain);

            println!("  Domain:     {}", parts.domain);
            println!("  Subdomain:  {}", subdomain);
            match domain.backend(subdomain) {
                Some(backend) => println!("  Proxy to:   {}", backend.target),
                None => {
                    let file = StaticFiles::candidate_path(domain, subdomain, &path)?;
                    println!("  File:       {}", file.display());
                    if domain.index_fallback {
                        println!("  Fallback:   {}", rustserve::files::fallback_path(&path));
                    }
                }
            }
        }
    }

    Ok(())
}

fn sorted(config: &ServerConfig) -> impl Iterator<Item = (&String, &DomainConfig)> {
    let mut domains: Vec<_> = config.domains.iter().collect();
    domains.sort_by(|a, b| a.0.cmp(b.0));
    domains.into_iter()
}
