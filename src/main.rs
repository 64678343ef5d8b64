use anyhow::Context;
use clap::Parser;
use std::io::Write;
use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;
use wke::adapters::rsync;
use wke::config::cli::{parse_defines, parse_targets, Cli, Commands, PlotArgs, RunArgs};
use wke::utils::{csv_merge, logger, plot};
use wke::{parse_selector, Cluster, Configuration, PreludeChoice, RunOptions, Runner};

/// Set to `json` for machine-readable log events on stderr.
const LOG_FORMAT_VAR: &str = "WKE_LOG_FORMAT";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match std::env::var(LOG_FORMAT_VAR).as_deref() {
        Ok("json") => logger::init_json_logger(cli.verbose()),
        _ => logger::init_cli_logger(cli.verbose()),
    }

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            println!("[ERROR] {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Commands::Run(args) => run_command(args).await,
        Commands::ShowConfig {
            config_name,
            verbose,
            json,
            cwd,
        } => {
            change_dir(cwd.as_deref())?;
            let config = Configuration::load(&config_name, ".")?;
            show_config(&config, verbose, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::ShowCluster {
            cluster_file,
            cwd,
            json,
        } => {
            change_dir(cwd.as_deref())?;
            let cluster = Cluster::from_file(&cluster_file)?;
            show_cluster(&cluster, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::ShowMachine {
            machine_name,
            cluster_file,
            cwd,
            json,
        } => {
            change_dir(cwd.as_deref())?;
            let cluster = Cluster::from_file(&cluster_file)?;
            let machine = cluster.get_machine(&machine_name)?;
            if json {
                println!("{}", serde_json::to_string(&machine.generate_metadata())?);
            } else {
                println!("external-addr={}", machine.external_addr);
                println!("internal-addr={}", machine.internal_addr);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::GetMachineAttribute {
            machine_name,
            attribute,
            cluster_file,
            cwd,
        } => {
            change_dir(cwd.as_deref())?;
            let cluster = Cluster::from_file(&cluster_file)?;
            let meta = cluster.get_machine(&machine_name)?.generate_metadata();
            match meta.get(&attribute) {
                Some(serde_json::Value::String(value)) => println!("{}", value),
                Some(value) => println!("{}", value),
                None => anyhow::bail!("No such attribute \"{}\"", attribute),
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Connect {
            machine_name,
            cluster_file,
        } => {
            let cluster = Cluster::from_file(&cluster_file)?;
            let machine = cluster.get_machine(&machine_name)?;
            let endpoint = cluster.endpoint(machine, None);
            println!("Found machine. Launching SSH.");

            let status = tokio::process::Command::new("ssh")
                .args(rsync::ssh_args(&endpoint))
                .status()
                .await
                .context("Failed to launch ssh")?;
            Ok(if status.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Cleanup {
            selector,
            cluster_file,
            cwd,
            verbose,
        } => {
            change_dir(cwd.as_deref())?;
            let cluster = Cluster::from_file(&cluster_file)?;
            let selection = parse_selector(&selector, &cluster)?;
            let success = Runner::ssh().cleanup(&selection, verbose).await?;
            Ok(if success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::MergeCsv {
            infile1,
            infile2,
            outfile,
        } => {
            csv_merge::merge_csv(&infile1, &infile2, &outfile)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::PlotLoads(args) => plot_loads_command(args).await,
    }
}

async fn plot_loads_command(args: PlotArgs) -> anyhow::Result<ExitCode> {
    println!("Writing plot to \"{}\"", args.out.display());

    if !args.follow {
        plot::plot_loads(&args.logfolder, &args.out, args.machine_index)?;
        return Ok(ExitCode::SUCCESS);
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(args.update_interval.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                plot::plot_loads(&args.logfolder, &args.out, args.machine_index)?;
                print!(".");
                std::io::stdout().flush()?;
            }
            result = &mut ctrl_c => {
                result.context("Cannot listen for Ctrl-C")?;
                println!();
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
}

fn change_dir(cwd: Option<&Path>) -> anyhow::Result<()> {
    if let Some(cwd) = cwd {
        std::env::set_current_dir(cwd)
            .with_context(|| format!("Cannot change working directory to {}", cwd.display()))?;
    }
    Ok(())
}

async fn run_command(args: RunArgs) -> anyhow::Result<ExitCode> {
    change_dir(args.cwd.as_deref())?;

    let cluster = Cluster::from_file(&args.cluster_file)?;
    let config = Configuration::load(&args.config_name, ".")?;
    let selection = parse_selector(&args.selector, &cluster)?;
    let targets = parse_targets(&args.targets, &config)?;
    let options = parse_defines(&args.defines, targets.len())?;

    let mut run_options = RunOptions::default()
        .with_verbose(args.verbose)
        .with_debug(args.debug)
        .with_multiply(args.multiply)
        .with_dry_run(args.dry_run)
        .with_prelude(PreludeChoice::from_arg(args.prelude.as_deref()));
    if let Some(workdir) = args.workdir {
        run_options = run_options.with_workdir(workdir);
    }
    if let Some(timeout) = args.timeout {
        let timeout = Duration::try_from_secs_f64(timeout)
            .with_context(|| format!("Invalid timeout {}", timeout))?;
        run_options = run_options.with_timeout(timeout);
    }

    let runner = Runner::ssh();
    for target in &targets {
        let success = match runner
            .run(&selection, &config, target, Some(&options), &run_options)
            .await
        {
            Ok(success) => success,
            Err(err) => {
                println!("[ERROR] {}", err);
                false
            }
        };

        if !success {
            println!("Abort.");
            return Ok(ExitCode::FAILURE);
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn list_level1(content: &str) {
    println!(" ⦿ {}", content);
}

fn list_level2(content: &str) {
    println!("   - {}", content);
}

fn list_level3(content: &str) {
    println!("      • {}", content);
}

fn as_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn show_config(config: &Configuration, verbose: bool, json: bool) -> anyhow::Result<()> {
    let meta = config.generate_metadata(verbose);

    if json {
        println!("{}", serde_json::to_string(&meta)?);
        return Ok(());
    }

    match meta["preludes"].as_object() {
        Some(preludes) if !preludes.is_empty() => {
            println!("Preludes:");
            for (name, about) in preludes {
                list_level1(&format!("{}: {}", name, as_text(about)));
            }
        }
        _ => println!("Preludes: None"),
    }

    println!();
    println!("Targets:");
    let Some(targets) = meta["targets"].as_object() else {
        return Ok(());
    };

    for (name, target) in targets {
        if !verbose || target.is_string() {
            list_level1(&format!("{}: {}", name, as_text(target)));
            continue;
        }

        list_level1(name);
        if let Some(about) = target.get("about") {
            list_level2(&format!("About: {}", as_text(about)));
        }

        let options = target
            .get("options")
            .and_then(serde_json::Value::as_array)
            .cloned()
            .unwrap_or_default();
        if options.is_empty() {
            list_level2("No arguments");
            continue;
        }

        list_level2("Arguments:");
        for option in options {
            let name = as_text(&option["name"]);
            if option["required"].as_bool().unwrap_or(false) {
                list_level3(&format!("{} [required]", name));
            } else {
                list_level3(&format!(
                    "{} [default: '{}']",
                    name,
                    as_text(&option["default-value"])
                ));
            }
        }
    }

    Ok(())
}

fn show_cluster(cluster: &Cluster, json: bool) -> anyhow::Result<()> {
    let meta = cluster.generate_metadata();

    if json {
        println!("{}", serde_json::to_string(&meta)?);
        return Ok(());
    }

    list_level2("Machines");
    for machine in cluster.machines() {
        list_level3(&format!(
            "{}: external-addr={} internal-addr={}",
            machine.name, machine.external_addr, machine.internal_addr
        ));
    }
    Ok(())
}
