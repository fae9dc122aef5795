//! Scripted walk through the indexing pipeline
//!
//! Players with a lazily maintained per-host `Location` index and users
//! with an eager unique `Email` index, on an in-process cluster.

use std::time::Duration;

use anyhow::{Context, Result};
use grainidx::{
  Runtime,
  domain::{
    actor::{ActorRef, IndexName},
    image::Image,
  },
  index::{ActorTypeConfig, IndexDeclaration, PropertyGenerator},
};
use grainidx_core::Config;
use tracing::info;

fn actor_types() -> Vec<ActorTypeConfig> {
  vec![
    ActorTypeConfig::new("Player")
      .fault_tolerant()
      .index(IndexDeclaration::new("Location", PropertyGenerator::new("Location")).per_host()),
    ActorTypeConfig::new("User").index(IndexDeclaration::new("Email", PropertyGenerator::new("Email")).unique().eager()),
  ]
}

async fn settle(runtime: &Runtime) {
  while runtime.pending_workflows().await > 0 {
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

async fn print_lookup(runtime: &Runtime, index: &str, key: &str) -> Result<()> {
  let mut found = runtime.lookup(&IndexName::new(index), &Image::from(key)).await?;
  found.sort();
  let names: Vec<_> = found.iter().map(ToString::to_string).collect();
  println!("  {index}[{key}] = [{}]", names.join(", "));
  Ok(())
}

pub async fn cmd_demo(config: Config, nodes: usize, kill_node: bool) -> Result<()> {
  let mut builder = Runtime::builder().config(config).nodes(nodes);
  for actor_type in actor_types() {
    builder = builder.actor_type(actor_type);
  }
  let runtime = builder.build().await.context("Failed to start runtime")?;
  println!("Cluster: {} nodes", runtime.live_nodes().len());

  let players: Vec<_> = (1..=3).map(|i| ActorRef::new("Player", format!("P{i}"))).collect();
  for player in &players {
    runtime.grain(player).await?.set_property("Location", "Seattle").await?;
  }
  settle(&runtime).await;
  println!("\nAll players in Seattle:");
  print_lookup(&runtime, "Location", "Seattle").await?;

  runtime.deactivate(&players[1]).await;
  runtime.grain(&players[1]).await?.set_property("Location", "Portland").await?;
  settle(&runtime).await;
  println!("\nP2 moved to Portland:");
  print_lookup(&runtime, "Location", "Seattle").await?;
  print_lookup(&runtime, "Location", "Portland").await?;

  if kill_node && let Some(queue) = runtime.queues().live(&runtime).first() {
    let node = queue.node();
    runtime.kill_node(node).await;
    println!("\nKilled {node}, hosting the Player workflow queue");
    runtime.grain(&players[0]).await?.set_property("Location", "Portland").await?;
    settle(&runtime).await;
    print_lookup(&runtime, "Location", "Seattle").await?;
    print_lookup(&runtime, "Location", "Portland").await?;
  }

  println!("\nUnique email:");
  let (u1, u2) = (ActorRef::new("User", "U1"), ActorRef::new("User", "U2"));
  runtime.grain(&u1).await?.set_property("Email", "neo@example.com").await?;
  match runtime.grain(&u2).await?.set_property("Email", "neo@example.com").await {
    Ok(_) => println!("  unexpected: second owner accepted"),
    Err(e) if e.is_uniqueness_violation() => println!("  {u2} rejected: {e}"),
    Err(e) => return Err(e.into()),
  }
  let owner = runtime
    .lookup_unique(&IndexName::new("Email"), &Image::from("neo@example.com"))
    .await?;
  println!("  Email[neo@example.com] = {owner}");

  info!("Demo finished");
  runtime.shutdown();
  Ok(())
}
