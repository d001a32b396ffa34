//! Eager demo
//!
//! Loads a user from a slow fake backend, then refetches it and updates it
//! optimistically. Two derivations of the user's name are rendered side by
//! side: a vanilla async one, which is pending after every change, and an eager
//! one, which only suspends while the user itself is pending.
//!
//! # Usage
//!
//! ```bash
//! eager-demo run --delay-ms 300 --rounds 2
//! eager-demo config
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use eager_core::init;
use eager_core::{eager_atom, Atom, Deferred, Eventual, InitBuilder, Rejection, Store};

#[derive(Parser)]
#[command(name = "eager-demo")]
#[command(about = "Compare vanilla and eager derivations of a slow fetch", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a user, refetch it, then update it optimistically
    Run {
        /// Latency of the fake backend
        #[arg(long, default_value_t = 500)]
        delay_ms: u64,

        /// How many refetch and update cycles to run
        #[arg(long, default_value_t = 1)]
        rounds: u32,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Debug, Clone)]
struct User {
    id: u32,
    name: String,
}

static NEXT_USER_ID: AtomicU32 = AtomicU32::new(100);

fn fetch_user(delay: Duration) -> Deferred<User> {
    Deferred::spawn(async move {
        tokio::time::sleep(delay).await;
        Ok::<_, Rejection>(User {
            id: NEXT_USER_ID.fetch_add(1, Ordering::Relaxed),
            name: "John Doe".to_string(),
        })
    })
}

/// One rendered derivation and how often it made its reader wait
struct Panel {
    title: &'static str,
    name: Atom<Eventual<String>>,
    suspensions: u32,
}

impl Panel {
    async fn render(&mut self, store: &Store) -> Result<()> {
        let value = store.get(&self.name)?;
        let name = if store.registry().is_known(&value) {
            store.registry().fulfilled_value(value)?
        } else {
            self.suspensions += 1;
            println!("[{}] Loading...", self.title);
            match value {
                Eventual::Now(name) => name,
                Eventual::Later(pending) => store.registry().observe(&pending).await?,
            }
        };
        println!("[{}] Name: {} (suspensions: {})", self.title, name, self.suspensions);
        Ok(())
    }
}

async fn render_all(store: &Store, panels: &mut [Panel]) -> Result<()> {
    for panel in panels.iter_mut() {
        panel.render(store).await?;
    }
    Ok(())
}

async fn run(delay: Duration, rounds: u32) -> Result<()> {
    let store = Store::new();
    let user = Atom::deferred(Eventual::Later(fetch_user(delay)));

    let vanilla = {
        let user = user.clone();
        Atom::derived_async(move |get, _| {
            let user = get.get(&user)?;
            let registry = get.registry().clone();
            Ok(Eventual::Later(get.registry().spawn(async move {
                let user = match user {
                    Eventual::Now(user) => user,
                    Eventual::Later(pending) => registry.observe(&pending).await?,
                };
                Ok(user.name.to_uppercase())
            })))
        })
    };
    let eager = {
        let user = user.clone();
        eager_atom(move |get| Ok(get.get(&user)?.name.to_uppercase()))
    };

    let mut panels = [
        Panel {
            title: "vanilla",
            name: vanilla,
            suspensions: 0,
        },
        Panel {
            title: "eager",
            name: eager,
            suspensions: 0,
        },
    ];

    println!("== Initial load");
    render_all(&store, &mut panels).await?;

    for round in 1..=rounds {
        info!(round, "Starting round");

        println!("== Refetch");
        store.set(&user, Eventual::Later(fetch_user(delay)))?;
        render_all(&store, &mut panels).await?;

        println!("== Update optimistically");
        let current = store.resolve(&user).await?;
        let mut chars = current.name.chars();
        let rotated = match chars.next() {
            Some(first) => format!("{}{}", chars.as_str(), first),
            None => String::new(),
        };
        info!(id = current.id, name = %rotated, "Optimistic update");
        store.set(
            &user,
            Eventual::Now(User {
                name: rotated,
                ..current
            }),
        )?;
        render_all(&store, &mut panels).await?;
    }

    println!("== Suspensions");
    for panel in &panels {
        println!("{}: {}", panel.title, panel.suspensions);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = InitBuilder::new().install_logging(true);
    if let Some(path) = &cli.config {
        builder = builder.config_path(path.clone());
    }
    builder.init()?;

    match cli.command {
        Commands::Run { delay_ms, rounds } => run(Duration::from_millis(delay_ms), rounds).await?,
        Commands::Config => {
            let config = init::get_config().cloned().unwrap_or_default();
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
