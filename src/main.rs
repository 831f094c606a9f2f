// model = "claude-opus-4-5"
// created = "2026-01-30"
// modified = "2026-10-14"
// driver = "Isaac Clayton"

//! Demo: two replicas write concurrently and converge.
//!
//! With a path argument, builds the partition set described by that JSON
//! config instead and prints what it created. Set `RUST_LOG=debug` to watch
//! atoms move.

use tracing_subscriber::EnvFilter;

use weft::bot::Bot;
use weft::bot::BotEvent;
use weft::config::PartitionServices;
use weft::config::PartitionSetConfig;
use weft::crdt::primitives::SiteId;
use weft::partition::Partition;
use weft::partition::causal_tree::CausalTreePartition;
use weft::partition::query::BotQueryClient;
use weft::partition::query::StaticQuery;
use weft::partition::remote::CausalRepoClient;
use weft::partition::remote::RecordingClient;
use weft::partition::stream::on_bots_updated;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn converge() -> weft::Result<()> {
    let mut alice = CausalTreePartition::new(SiteId::from("alice"), None);
    let mut bob = CausalTreePartition::new(SiteId::from("bob"), None);
    alice.connect()?;
    bob.connect()?;
    alice.subscribe(on_bots_updated(|updates| {
        for update in updates {
            tracing::info!(bot = %update.bot.id, tags = ?update.tags, "alice saw an update");
        }
    }), false);

    alice.apply_events(&[BotEvent::add(Bot::new("b1").with_tag("color", "red").with_tag("label", "hello"))])?;
    bob.add_atoms(alice.atoms());

    alice.apply_events(&[BotEvent::set_tag("b1", "color", "blue")])?;
    bob.apply_events(&[BotEvent::set_tag("b1", "color", "green")])?;
    let from_alice = alice.atoms();
    let from_bob = bob.atoms();
    alice.add_atoms(from_bob);
    bob.add_atoms(from_alice);

    let state = alice.state();
    println!("{}", serde_json::to_string_pretty(&*state).unwrap_or_default());
    tracing::info!(converged = (*state == *bob.state()), atoms = alice.weave().len(), "done");
    return Ok(());
}

fn from_config(path: &str) -> weft::Result<()> {
    let config = PartitionSetConfig::from_path(path)?;
    let mut services = PartitionServices::new(SiteId::from("demo"), "demo")
        .with_repo_client(Box::new(|_host: &str| -> Box<dyn CausalRepoClient> { Box::new(RecordingClient::new()) }))
        .with_query_client(Box::new(|_host: &str, _branch: &str| -> Box<dyn BotQueryClient> {
            Box::new(StaticQuery::new(Vec::new()))
        }));
    let mut set = config.create(&mut services)?;
    set.connect()?;
    for space in set.spaces() {
        let kind = set.member(space).map(|member| member.kind()).unwrap_or("missing");
        println!("{space}: {kind}");
    }
    tracing::info!(synced = set.is_synced(), "partition set ready");
    return Ok(());
}

fn main() -> weft::Result<()> {
    init_tracing();
    match std::env::args().nth(1) {
        Some(path) => return from_config(&path),
        None => return converge(),
    }
}
