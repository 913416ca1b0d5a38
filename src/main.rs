use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use vessel::{
    Result, VesselError,
    config::{VesselConfig, parse_size_to_gib},
    confirmation::{AutoConfirm, Confirmed, Confirmer, TerminalConfirmer},
    dispatcher::DispatchReport,
    logger,
    notifications::Notification,
    reconciler::RegistryChange,
    registry::RegistryView,
    session::ConsoleSession,
    vm::{Action, CreateVmRequest, ScheduleRequest, Snapshot, Vm, describe_media},
};

#[derive(Parser)]
#[command(name = "vessel")]
#[command(about = "Lifecycle console for a remote hypervisor")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to Vessel.toml (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override api.base_url
    #[arg(long)]
    api_url: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Answer yes to every confirmation
    #[arg(short, long)]
    yes: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List all VMs
    #[command(alias = "ls")]
    List,
    /// Show one VM in detail
    Show {
        /// Name of the VM
        name: String,
    },
    /// Send a lifecycle action (start, resume, reboot, shutdown, poweroff, pause)
    Control {
        /// Name of the VM
        name: String,
        /// Action to send
        action: String,
    },
    /// Start a VM
    Start { name: String },
    /// Power off a VM immediately
    Stop { name: String },
    /// Ask the guest to shut down
    Shutdown { name: String },
    /// Reboot a VM
    Reboot { name: String },
    /// Pause a running VM
    Pause { name: String },
    /// Resume a paused VM
    Resume { name: String },
    /// Create a new VM
    Create {
        /// Name of the VM (letters, numbers, '-', '_', '.')
        #[arg(long)]
        name: String,
        /// Number of virtual CPUs
        #[arg(long, default_value_t = 2)]
        cpu: u32,
        /// Memory size (e.g. "4Gi"; bare numbers are GiB)
        #[arg(long, default_value = "4Gi")]
        ram: String,
        /// Disk size (e.g. "20Gi"; bare numbers are GiB)
        #[arg(long, default_value = "20Gi")]
        disk: String,
        /// Guest operating system
        #[arg(long, default_value = "linux")]
        os: String,
    },
    /// Delete a VM
    Delete { name: String },
    /// Show live CPU usage of a VM
    Stats { name: String },
    /// VM snapshot management
    Snapshot {
        #[command(subcommand)]
        snapshot_command: SnapshotCommands,
    },
    /// Schedule a recurring snapshot
    Schedule {
        /// Name of the VM
        vm: String,
        /// Snapshot name
        snapshot: String,
        /// Cron day field
        #[arg(long, default_value = "*")]
        day: String,
        /// Cron interval field
        #[arg(long, default_value = "*/1")]
        interval: String,
    },
    /// Follow VM state changes until Ctrl-C
    Watch,
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// List snapshots of one VM, or of every VM
    List { vm: Option<String> },
    /// Create a snapshot (the current date is appended to the name)
    Create { vm: String, name: String },
    /// Delete a snapshot
    Delete { vm: String, snapshot: String },
    /// Restore a VM to a snapshot
    Restore { vm: String, snapshot: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        unsafe {
            std::env::set_var("RUST_LOG", "vessel=debug");
        }
    }
    logger::init_logger();

    let config_path = cli.config.clone().or_else(VesselConfig::default_path);

    if let Commands::Init { force } = cli.command {
        let path = config_path.ok_or_else(|| {
            VesselError::ConfigError("no configuration directory; pass --config".to_string())
        })?;
        if path.exists() && !force {
            println!("{} already exists (use --force to overwrite)", path.display());
            return Ok(());
        }
        VesselConfig::default().save_to_file(&path)?;
        println!("✅ Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // Load configuration
    let mut config = match &config_path {
        Some(path) if path.exists() => VesselConfig::from_file(path)?,
        Some(path) => {
            logger::warn!("{} not found, using defaults", path.display());
            VesselConfig::default()
        }
        None => VesselConfig::default(),
    };
    if let Some(url) = cli.api_url {
        config.api.base_url = url;
    }

    let confirmer: Arc<dyn Confirmer> = if cli.yes {
        Arc::new(AutoConfirm(true))
    } else {
        Arc::new(TerminalConfirmer)
    };
    let session = ConsoleSession::connect(config, confirmer)?;

    match cli.command {
        Commands::List => {
            session.refresh().await?;
            print_vm_table(&session.view());
        }
        Commands::Show { name } => {
            let vm = session.vm_details(&name).await?;
            print_vm_details(&vm);
        }
        Commands::Control { name, action } => {
            session.refresh().await?;
            report_control(session.control(&name, &action).await?);
        }
        Commands::Start { name } => run_action(&session, &name, Action::Start).await?,
        Commands::Stop { name } => run_action(&session, &name, Action::Poweroff).await?,
        Commands::Shutdown { name } => run_action(&session, &name, Action::Shutdown).await?,
        Commands::Reboot { name } => run_action(&session, &name, Action::Reboot).await?,
        Commands::Pause { name } => run_action(&session, &name, Action::Pause).await?,
        Commands::Resume { name } => run_action(&session, &name, Action::Resume).await?,
        Commands::Create {
            name,
            cpu,
            ram,
            disk,
            os,
        } => {
            let request = CreateVmRequest {
                name,
                cpu,
                ram: parse_size_to_gib(&ram)?,
                disk: parse_size_to_gib(&disk)?,
                os,
            };
            let vm = session.create_vm(&request).await?;
            println!(
                "✅ VM '{}' created ({} vCPU, {} GiB RAM, {} GiB disk)",
                vm.name, request.cpu, request.ram, request.disk
            );
        }
        Commands::Delete { name } => {
            session.refresh().await?;
            match session.delete_vm(&name).await? {
                Confirmed::Proceeded(()) => println!("✅ VM '{}' deleted", name),
                Confirmed::Declined => println!("Cancelled"),
            }
        }
        Commands::Stats { name } => {
            let stats = session.vm_stats(&name).await?;
            println!("{}: {:.1}% CPU", name, stats.cpu_usage_percentage);
        }
        Commands::Snapshot { snapshot_command } => match snapshot_command {
            SnapshotCommands::List { vm: Some(vm) } => {
                let snapshots = session.list_snapshots(&vm).await?;
                if snapshots.is_empty() {
                    println!("No snapshots found for VM '{}'", vm);
                    return Ok(());
                }
                print_snapshot_table(&snapshots);
            }
            SnapshotCommands::List { vm: None } => {
                session.refresh().await?;
                let snapshots = session.list_all_snapshots().await;
                if snapshots.is_empty() {
                    println!("No snapshots found");
                    return Ok(());
                }
                print_snapshot_table(&snapshots);
            }
            SnapshotCommands::Create { vm, name } => {
                let stored = session.create_snapshot(&vm, &name).await?;
                println!("✅ Snapshot '{}' created for VM '{}'", stored, vm);
            }
            SnapshotCommands::Delete { vm, snapshot } => {
                match session.delete_snapshot(&vm, &snapshot).await? {
                    Confirmed::Proceeded(()) => println!("✅ Snapshot '{}' deleted", snapshot),
                    Confirmed::Declined => println!("Cancelled"),
                }
            }
            SnapshotCommands::Restore { vm, snapshot } => {
                match session.restore_snapshot(&vm, &snapshot).await? {
                    Confirmed::Proceeded(()) => {
                        println!("✅ VM '{}' restored to snapshot '{}'", vm, snapshot)
                    }
                    Confirmed::Declined => println!("Cancelled"),
                }
            }
        },
        Commands::Schedule {
            vm,
            snapshot,
            day,
            interval,
        } => {
            let request = ScheduleRequest {
                day,
                interval,
                ..ScheduleRequest::new(vm, snapshot)
            };
            session.schedule_snapshot(&request).await?;
            println!(
                "✅ Snapshot '{}' of VM '{}' scheduled",
                request.snapshot_name, request.vm_name
            );
        }
        Commands::Watch => watch(&session).await?,
        // Handled before the session is built.
        Commands::Init { .. } => {}
    }

    Ok(())
}

async fn run_action(session: &ConsoleSession, name: &str, action: Action) -> Result<()> {
    session.refresh().await?;
    report_control(session.control(name, action.as_str()).await?);
    Ok(())
}

fn report_control(outcome: Confirmed<DispatchReport>) {
    match outcome {
        Confirmed::Proceeded(report) => {
            println!("✅ {} sent to VM '{}'", report.action, report.vm_name);
            if !report.refreshed {
                println!("⚠️  The VM list could not be refreshed afterwards");
            }
        }
        Confirmed::Declined => println!("Cancelled"),
    }
}

async fn watch(session: &ConsoleSession) -> Result<()> {
    let mut changes = session.subscribe();
    let mut notifications = session.notifications().subscribe();
    let _sync = session.spawn_sync();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    println!("Watching VM state (Ctrl-C to stop)");
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            change = changes.recv() => match change {
                Ok(change) => print_change(&change),
                Err(RecvError::Lagged(missed)) => {
                    logger::warn!("Missed {} state changes", missed);
                }
                Err(RecvError::Closed) => break,
            },
            notification = notifications.recv() => {
                if let Ok(notification) = notification {
                    print_notification(&notification);
                }
            }
        }
    }

    Ok(())
}

fn print_vm_table(view: &RegistryView) {
    let vms = view.list();
    if vms.is_empty() {
        println!("No VMs found");
        return;
    }

    println!(
        "{:<20} {:<6} {:<12} {:<6} {:<10} {:<10} {:<15}",
        "NAME", "ID", "STATE", "VCPUS", "MEMORY", "DISK", "OS"
    );
    println!("{}", "=".repeat(85));

    for vm in vms {
        println!(
            "{:<20} {:<6} {:<12} {:<6} {:<10} {:<10} {:<15}",
            vm.name,
            vm.id.to_string(),
            vm.state.to_string(),
            vm.vcpus,
            format!("{:.1} GiB", vm.memory_gib()),
            format!("{:.1} GiB", vm.disk_capacity_gib()),
            vm.os_label()
        );
    }
}

fn print_vm_details(vm: &Vm) {
    println!("Name:       {}", vm.name);
    println!("ID:         {}", vm.id);
    println!("State:      {}", vm.state);
    println!("vCPUs:      {}", vm.vcpus);
    println!("Memory:     {:.1} GiB", vm.memory_gib());
    println!("Disk:       {:.1} GiB", vm.disk_capacity_gib());
    println!("OS:         {}", vm.os_label());
    if let Some(uuid) = &vm.uuid {
        println!("UUID:       {}", uuid);
    }
    if let Some(autostart) = vm.autostart {
        println!("Autostart:  {}", if autostart { "yes" } else { "no" });
    }

    for disk in &vm.disks {
        println!("Disk:       {}", describe_media(disk));
    }
    for cdrom in &vm.cdroms {
        println!("CD-ROM:     {}", describe_media(cdrom));
    }
}

fn print_snapshot_table(snapshots: &[Snapshot]) {
    println!("{:<20} {:<30} {:<22} {:<12}", "VM", "NAME", "CREATED", "SIZE");
    println!("{}", "=".repeat(85));

    for snapshot in snapshots {
        println!(
            "{:<20} {:<30} {:<22} {:<12}",
            snapshot.vm_name,
            snapshot.name,
            snapshot.date.as_deref().unwrap_or("-"),
            snapshot.size.as_deref().unwrap_or("-")
        );
    }
}

fn print_change(change: &RegistryChange) {
    match change {
        RegistryChange::Added { name, state } => println!("+ {} ({})", name, state),
        RegistryChange::StateChanged { name, from, to } => {
            println!("~ {}: {} -> {}", name, from, to)
        }
        RegistryChange::Removed { name } => println!("- {}", name),
    }
}

fn print_notification(notification: &Notification) {
    println!(
        "[{}] {}: {}",
        notification.at.format("%H:%M:%S"),
        notification.level,
        notification.message
    );
}
