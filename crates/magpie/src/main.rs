// SPDX-FileCopyrightText: 2026 Magpie Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Magpie - an always-on personal AI assistant kernel.
//!
//! This binary is an operational front door. `serve` requires the host to
//! embed a provider and channels (see [`magpie::run_serve`]); the other
//! subcommands inspect on-disk state.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use magpie_config::MagpieConfig;

/// Magpie - an always-on personal AI assistant kernel.
#[derive(Parser, Debug)]
#[command(name = "magpie", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the agent (requires an embedded provider; see docs).
    Serve,
    /// Show configuration and on-disk state.
    Status,
    /// List stored sessions.
    Sessions,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match magpie_config::load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: invalid configuration: {e}");
            std::process::exit(1);
        }
    };
    init_tracing(&config.agent.log_level);

    match cli.command {
        Commands::Serve => {
            // The kernel consumes an LlmProvider trait; no provider is
            // compiled into this binary. Hosts embed magpie as a library:
            //
            //   magpie::run_serve(config, ServeDeps { provider, adapters, tools }, cancel)
            eprintln!(
                "error: no LLM provider is compiled into this build.\n\
                 Embed magpie as a library and call magpie::run_serve with your \
                 provider and channel adapters."
            );
            std::process::exit(2);
        }
        Commands::Status => {
            print_status(&config).await;
        }
        Commands::Sessions => {
            print_sessions(&config).await;
        }
    }
}

async fn print_status(config: &MagpieConfig) {
    println!("agent:        {}", config.agent.name);
    println!("data dir:     {}", config.data_dir().display());
    println!("workspace:    {}", config.workspace_dir().display());
    println!(
        "concurrency:  {} messages, {} tools, {} subagents",
        config.agent.max_concurrent_messages, config.tools.parallelism, config.subagent.max_concurrent
    );

    match magpie_session::SessionStore::new(config.sessions_dir(), config.session.cache_entries) {
        Ok(store) => match store.list().await {
            Ok(sessions) => println!("sessions:     {}", sessions.len()),
            Err(e) => println!("sessions:     unreadable ({e})"),
        },
        Err(e) => println!("sessions:     unavailable ({e})"),
    }

    let skills = magpie_skill::SkillsRegistry::new(config.workspace_dir().join("skills"));
    println!("skills:       {}", skills.list().len());
}

async fn print_sessions(config: &MagpieConfig) {
    let store =
        match magpie_session::SessionStore::new(config.sessions_dir(), config.session.cache_entries)
        {
            Ok(s) => s,
            Err(e) => {
                eprintln!("error: cannot open session store: {e}");
                std::process::exit(1);
            }
        };
    match store.list().await {
        Ok(sessions) if sessions.is_empty() => println!("no sessions"),
        Ok(sessions) => {
            for info in sessions {
                println!("{}  {}", info.updated_at.format("%Y-%m-%d %H:%M:%S"), info.key);
            }
        }
        Err(e) => {
            eprintln!("error: cannot list sessions: {e}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("magpie={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .init();
}

#[cfg(test)]
mod tests {
    #[test]
    #[cfg(not(target_env = "msvc"))]
    fn global_allocator_is_jemalloc() {
        // The jemalloc control API only answers when jemalloc actually
        // backs the process; a readable, non-zero resident figure proves
        // the #[global_allocator] wiring took effect.
        use tikv_jemalloc_ctl::{epoch, stats};
        epoch::advance().expect("epoch advance requires jemalloc");
        let resident = stats::resident::read().expect("stats require jemalloc");
        assert_ne!(resident, 0);
    }
}
