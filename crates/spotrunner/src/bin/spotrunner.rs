use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, FromArgMatches};
use clap_complete::generate;
use cli_table::format::Separator;
use cli_table::{Cell, CellStruct, Style, Table, print_stdout};

use spotrunner::common::cli::{
    GenerateCompletionOpts, ImageCommand, ImageOpts, ImageRecordOpts, ProfileCommand,
    ProfileDeployOpts, ProfileOpts, ReconcileCommand, ReconcileJobsOpts, ReconcileOpts,
    RootOptions, ServerCommand, ServerOpts, ServerStartOpts, SubCommand,
};
use spotrunner::common::config::SpotrunnerConfig;
use spotrunner::common::setup::setup_logging;
use spotrunner::common::timeutils::format_duration;
use spotrunner::images::{ApplyOutcome, BuildEvent, apply_build_event, deploy_profile};
use spotrunner::reconcile::jobs::JobReconcileReport;
use spotrunner::reconcile::images::ImageReconcileReport;
use spotrunner::reconcile::{log_job_report, reconcile_process};
use spotrunner::router::profile::MachineProfile;
use spotrunner::server::bootstrap::Components;
use spotrunner::server::start_server;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

// Output

fn print_horizontal_table(rows: Vec<Vec<CellStruct>>, header: Vec<CellStruct>) {
    let table = rows
        .table()
        .separator(
            Separator::builder()
                .title(Some(Default::default()))
                .column(Some(Default::default()))
                .build(),
        )
        .title(header);
    if let Err(e) = print_stdout(table) {
        log::error!("Cannot print table to stdout: {e:?}");
    }
}

fn print_vertical_table(rows: Vec<Vec<CellStruct>>) {
    let table = rows.table().separator(
        Separator::builder()
            .column(Some(Default::default()))
            .build(),
    );
    if let Err(e) = print_stdout(table) {
        log::error!("Cannot print table to stdout: {e:?}");
    }
}

fn header(names: &[&str]) -> Vec<CellStruct> {
    names.iter().map(|name| name.cell().bold(true)).collect()
}

fn optional(value: Option<&str>) -> CellStruct {
    value.unwrap_or("-").cell()
}

fn print_job_report(report: &JobReconcileReport) {
    let mut rows = vec![
        vec!["Completed".cell().bold(true), report.completed.join(", ").cell()],
        vec!["Interrupted".cell().bold(true), report.interrupted.join(", ").cell()],
        vec!["Timed out".cell().bold(true), report.timed_out.join(", ").cell()],
        vec!["Orphans".cell().bold(true), report.orphans.join(", ").cell()],
        vec!["Purged".cell().bold(true), report.purged.cell()],
    ];
    rows.extend(report.failures.iter().map(|failure| {
        vec![
            "Failure".cell().bold(true),
            format!("{}: {}", failure.target, failure.message).cell(),
        ]
    }));
    print_vertical_table(rows);
}

fn print_image_report(report: &ImageReconcileReport) {
    let mut rows = vec![
        vec!["Checked".cell().bold(true), report.checked.join(", ").cell()],
        vec!["Updated".cell().bold(true), report.updated.join(", ").cell()],
    ];
    rows.extend(report.failures.iter().map(|failure| {
        vec![
            "Failure".cell().bold(true),
            format!("{}: {}", failure.target, failure.message).cell(),
        ]
    }));
    print_vertical_table(rows);
}

// Commands

async fn command_server_start(
    config: SpotrunnerConfig,
    opts: ServerStartOpts,
) -> anyhow::Result<()> {
    let listen = opts.listen.unwrap_or_else(|| config.server.listen.clone());
    let interval = if opts.no_reconcile {
        None
    } else {
        Some(
            opts.reconcile_interval
                .map(|interval| interval.unpack())
                .unwrap_or(config.policy.reconcile_interval),
        )
    };
    let components = Components::from_config(config)?;
    start_server(components, &listen, interval).await?;
    Ok(())
}

async fn command_reconcile_jobs(
    config: SpotrunnerConfig,
    opts: ReconcileJobsOpts,
) -> anyhow::Result<()> {
    let components = Components::from_config(config)?;
    let reconciler = components.job_reconciler();
    match opts.interval {
        Some(interval) => {
            let interval = interval.unpack();
            log::info!("Reconciling jobs every {}", format_duration(interval));
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received SIGINT, stopping");
                }
                _ = reconcile_process(Arc::new(reconciler), None, interval) => {}
            }
        }
        None => {
            let report = reconciler.reconcile().await;
            log_job_report(&report);
            print_job_report(&report);
        }
    }
    Ok(())
}

async fn command_reconcile_images(config: SpotrunnerConfig) -> anyhow::Result<()> {
    let components = Components::from_config(config)?;
    let report = components.image_reconciler().reconcile().await?;
    print_image_report(&report);
    Ok(())
}

async fn command_status(config: SpotrunnerConfig) -> anyhow::Result<()> {
    let components = Components::from_config(config)?;
    let reconciler = Arc::new(components.image_reconciler());
    let status = components
        .status_aggregator(Some(reconciler))
        .status()
        .await?;

    print_vertical_table(vec![
        vec!["Status".cell().bold(true), format!("{:?}", status.status).cell()],
        vec!["Message".cell().bold(true), status.message.cell()],
        vec![
            "GitHub".cell().bold(true),
            format!("{:?}: {}", status.github.status, status.github.message).cell(),
        ],
    ]);
    let rows = status
        .profiles
        .iter()
        .map(|profile| {
            vec![
                profile.name.as_str().cell(),
                profile.status.to_string().cell(),
                optional(profile.image_id.as_deref()),
                profile.updated_at.to_rfc3339().cell(),
            ]
        })
        .collect();
    print_horizontal_table(rows, header(&["Profile", "Image status", "Image", "Updated"]));
    Ok(())
}

fn profile_name(file: &Path, document: &serde_json::Value) -> anyhow::Result<String> {
    if let Some(name) = document.get("name").and_then(|name| name.as_str()) {
        return Ok(name.to_string());
    }
    file.file_stem()
        .and_then(|stem| stem.to_str())
        .map(|stem| stem.to_string())
        .with_context(|| format!("Cannot derive a profile name from {}", file.display()))
}

fn command_profile_deploy(config: SpotrunnerConfig, opts: ProfileDeployOpts) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&opts.file)
        .with_context(|| format!("Cannot read profile {}", opts.file.display()))?;
    let document: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("Profile {} is not valid JSON", opts.file.display()))?;
    let name = match opts.name {
        Some(name) => name,
        None => profile_name(&opts.file, &document)?,
    };

    let components = Components::from_config(config)?;
    let profile = deploy_profile(
        components.images.as_ref(),
        components.profiles.as_ref(),
        &name,
        document,
        components.clock.now(),
    )?;
    println!(
        "Profile `{}` deployed ({}, {})",
        profile.name,
        profile.architecture.runner_name(),
        profile.spot_policy
    );
    Ok(())
}

fn command_profile_list(config: SpotrunnerConfig) -> anyhow::Result<()> {
    let components = Components::from_config(config)?;
    let mut rows = vec![];
    for name in components.profiles.list()? {
        let Some(document) = components.profiles.get(&name)? else {
            continue;
        };
        let image = components.images.get_image(&name)?;
        let image_status = image
            .as_ref()
            .map(|record| record.status.to_string())
            .unwrap_or_else(|| "-".to_string());
        match MachineProfile::from_document(&name, document) {
            Ok(profile) => rows.push(vec![
                name.cell(),
                profile.architecture.runner_name().cell(),
                profile.instance_types.join(", ").cell(),
                profile.spot_policy.to_string().cell(),
                optional(profile.usable_image()),
                image_status.cell(),
            ]),
            Err(error) => rows.push(vec![
                name.cell(),
                "-".cell(),
                "-".cell(),
                "-".cell(),
                format!("invalid: {error}").cell(),
                image_status.cell(),
            ]),
        }
    }
    print_horizontal_table(
        rows,
        header(&[
            "Name",
            "Architecture",
            "Instance types",
            "Spot policy",
            "Image",
            "Image status",
        ]),
    );
    Ok(())
}

fn command_image_record(config: SpotrunnerConfig, opts: ImageRecordOpts) -> anyhow::Result<()> {
    let components = Components::from_config(config)?;
    let event = BuildEvent {
        profile: opts.profile,
        status: opts.status,
        image_id: opts.image_id,
        build_id: opts.build_id,
        error: opts.error,
        timestamp: opts.timestamp.unwrap_or_else(|| components.clock.now()),
    };
    match apply_build_event(
        components.images.as_ref(),
        components.profiles.as_ref(),
        &event,
    )? {
        ApplyOutcome::Applied => {
            println!("Image of profile `{}` is {}", event.profile, event.status)
        }
        ApplyOutcome::Stale => println!(
            "A newer state of profile `{}` is recorded already, nothing was changed",
            event.profile
        ),
    }
    Ok(())
}

fn generate_completion(opts: GenerateCompletionOpts) -> anyhow::Result<()> {
    let generator = opts.shell;

    let mut app = RootOptions::command();
    eprintln!("Generating completion file for {generator}...");
    generate(generator, &mut app, "spotrunner".to_string(), &mut io::stdout());
    Ok(())
}

#[tokio::main]
async fn main() -> spotrunner::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let result = match SpotrunnerConfig::load(top_opts.common.config.as_deref()) {
        Ok(config) => match top_opts.subcmd {
            SubCommand::Server(ServerOpts {
                subcmd: ServerCommand::Start(opts),
            }) => command_server_start(config, opts).await,
            SubCommand::Reconcile(ReconcileOpts {
                subcmd: ReconcileCommand::Jobs(opts),
            }) => command_reconcile_jobs(config, opts).await,
            SubCommand::Reconcile(ReconcileOpts {
                subcmd: ReconcileCommand::Images,
            }) => command_reconcile_images(config).await,
            SubCommand::Status => command_status(config).await,
            SubCommand::Profile(ProfileOpts {
                subcmd: ProfileCommand::Deploy(opts),
            }) => command_profile_deploy(config, opts),
            SubCommand::Profile(ProfileOpts {
                subcmd: ProfileCommand::List,
            }) => command_profile_list(config),
            SubCommand::Image(ImageOpts {
                subcmd: ImageCommand::Record(opts),
            }) => command_image_record(config, opts),
            SubCommand::GenerateCompletion(opts) => generate_completion(opts),
        },
        Err(error) => Err(error.into()),
    };

    if let Err(e) = result {
        log::error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
