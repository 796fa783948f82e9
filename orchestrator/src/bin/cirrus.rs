// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Demo program: starts an orchestrator from a config file, creates a few
//! VMs through the bus, and prints the resulting capacity

use anyhow::Context;
use camino::Utf8PathBuf;
use cirrus_bus::Destination;
use cirrus_bus::SubscriberFn;
use cirrus_common::cmd::fatal;
use cirrus_common::cmd::CmdError;
use cirrus_orchestrator::destinations;
use cirrus_orchestrator::Config;
use cirrus_orchestrator::Orchestrator;
use cirrus_orchestrator::ResourceUsageEvent;
use cirrus_orchestrator::VmCreateParams;
use clap::Parser;
use slog::info;
use slog::warn;
use std::collections::BTreeSet;

#[derive(Debug, Parser)]
#[clap(name = "cirrus", about = "Drive the orchestration core with demo VMs")]
struct Args {
    /// Orchestrator configuration file
    #[clap(name = "CONFIG_FILE_PATH", action)]
    config_file_path: Utf8PathBuf,

    /// Number of VMs to create
    #[clap(long, default_value_t = 3, action)]
    vms: usize,

    /// Memory of each VM
    #[clap(long, default_value_t = 2048, action)]
    memory_mib: u64,

    /// Root disk size of each VM
    #[clap(long, default_value_t = 20, action)]
    disk_gib: u64,

    /// L3 network to attach each VM to
    #[clap(long, action)]
    network: Option<String>,

    /// Destroy the VMs again before exiting
    #[clap(long, action)]
    destroy: bool,
}

#[tokio::main]
async fn main() {
    if let Err(error) = do_run().await {
        fatal(CmdError::Failure(format!("{:#}", error)));
    }
}

async fn do_run() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file_path)?;
    let log = config
        .log
        .to_logger("cirrus")
        .context("failed to create logger")?;

    let orchestrator = Orchestrator::start(&config, &log)
        .await
        .context("failed to start orchestrator")?;

    let usage_log = log.clone();
    orchestrator.bus().subscribe(
        &Destination::from_static(destinations::RESOURCE_USAGE),
        SubscriberFn::new(move |event| {
            let log = usage_log.clone();
            async move {
                let usage: ResourceUsageEvent = event.payload()?;
                info!(log, "resource usage";
                    "action" => ?usage.action,
                    "instance_id" => %usage.instance_id,
                    "memory_mib" => usage.memory_mib,
                    "disk_gib" => usage.disk_gib,
                );
                Ok(())
            }
        }),
    );

    let requests = (0..args.vms).map(|i| VmCreateParams {
        name: format!("demo-{}", i),
        memory_mib: args.memory_mib,
        disk_gib: args.disk_gib,
        zone_id: None,
        cluster_id: None,
        network: args.network.clone(),
        avoid_hosts: BTreeSet::new(),
    });
    let orchestrator = &orchestrator;
    let results = futures::future::join_all(
        requests.map(|params| async move {
            let result = orchestrator.create_vm(&params).await;
            (params.name, result)
        }),
    )
    .await;

    let mut created = Vec::new();
    for (name, result) in results {
        match result {
            Ok(instance) => {
                println!(
                    "created {} ({}) on host {}",
                    name, instance.id, instance.host_id
                );
                created.push(instance);
            }
            Err(error) => println!("failed to create {}: {}", name, error),
        }
    }

    let snapshots = orchestrator.tracker().snapshots();
    println!("{}", serde_json::to_string_pretty(&snapshots)?);

    if args.destroy {
        for instance in &created {
            orchestrator
                .destroy_vm(instance.id)
                .await
                .with_context(|| format!("destroying {}", instance.name))?;
            println!("destroyed {} ({})", instance.name, instance.id);
        }
    }

    let orphans = orchestrator.orphaned_reservations();
    if !orphans.is_empty() {
        warn!(log, "found orphaned reservations"; "count" => orphans.len());
    }
    orchestrator.stop()?;
    Ok(())
}
