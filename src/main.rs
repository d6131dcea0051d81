use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use eyre::{Result, eyre};
use helpdesk::{
    Caller, Config, Filter, Role, StatusUpdateRequest, Store, StoreDirectory, Ticket, TicketService, TicketStatus,
    TimerToggleRequest, User,
};
use std::path::PathBuf;
use tracing::Level;

#[derive(Parser)]
#[command(name = "helpdesk")]
#[command(about = "Helpdesk CLI - ticket lifecycle and time tracking")]
#[command(version = env!("GIT_DESCRIBE"))]
struct Cli {
    /// Path to the store directory (overrides config)
    #[arg(short, long)]
    store_path: Option<PathBuf>,

    /// Path to a YAML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Acting user id (overrides config)
    #[arg(long = "as")]
    actor: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Open a new ticket
    Create { title: String },

    /// Show one ticket
    Show { id: String },

    /// List tickets
    List {
        #[arg(long)]
        status: Option<String>,
        /// Hide tickets in this status
        #[arg(long, conflicts_with = "status")]
        exclude_status: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
    },

    /// Change status and/or assignee (admin only)
    Status {
        id: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, conflicts_with = "unassign")]
        assign: Option<String>,
        #[arg(long)]
        unassign: bool,
    },

    /// Pause or resume the work clock
    Timer {
        id: String,
        /// pause or resume
        action: String,
    },

    /// Rebuild the SQLite cache from JSONL files
    Sync,
}

#[derive(Subcommand)]
enum UserCommands {
    /// Add or replace a user
    Add {
        id: String,
        name: String,
        #[arg(long)]
        admin: bool,
    },

    /// List users
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let level = if cli.verbose { Level::DEBUG } else { config.level() };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let store_path = cli.store_path.clone().unwrap_or_else(|| config.store_path.clone());
    let actor = cli.actor.clone().or_else(|| config.actor.clone());

    let store = Store::open(&store_path)?;
    let directory = StoreDirectory::open(&store_path)?;
    let mut service = TicketService::new(store, directory);

    match cli.command {
        Commands::User { command } => match command {
            UserCommands::Add { id, name, admin } => {
                let role = if admin { Role::Admin } else { Role::Member };
                service.store_mut().create(User::new(&id, &name, role, Utc::now()))?;
                println!("Added {} ({})", id.bold(), role);
            }
            UserCommands::List => {
                let users: Vec<User> = service.store().list(&[])?;
                for user in users {
                    println!("{:<20} {:<30} {}", user.id, user.name, user.role);
                }
            }
        },
        Commands::Create { title } => {
            let created_by = actor.unwrap_or_else(|| "cli".to_string());
            let ticket = Ticket::new(title, created_by, Utc::now());
            service.store_mut().create(ticket.clone())?;
            println!("Created ticket {}", ticket.id.bold());
        }
        Commands::Show { id } => {
            let ticket = service.get(&id)?;
            print_ticket(&ticket);
        }
        Commands::List {
            status,
            exclude_status,
            assignee,
        } => {
            let mut filters = Vec::new();
            if let Some(status) = status {
                let status: TicketStatus = status.parse()?;
                filters.push(Filter::eq("status", status.as_str()));
            }
            if let Some(status) = exclude_status {
                let status: TicketStatus = status.parse()?;
                filters.push(Filter::ne("status", status.as_str()));
            }
            if let Some(assignee) = assignee {
                filters.push(Filter::eq("assignee_id", assignee));
            }

            let tickets: Vec<Ticket> = service.store().list(&filters)?;
            if tickets.is_empty() {
                println!("No tickets");
            }
            for ticket in tickets {
                println!(
                    "{}  {:<12} {:<16} {}",
                    ticket.id,
                    colored_status(ticket.status),
                    ticket.assignee_id.as_deref().unwrap_or("-"),
                    ticket.title
                );
            }
        }
        Commands::Status {
            id,
            status,
            assign,
            unassign,
        } => {
            let actor = actor.ok_or_else(|| eyre!("No actor: pass --as or set `actor` in the config file"))?;
            let assignee_id = match (assign, unassign) {
                (Some(assignee), _) => Some(Some(assignee)),
                (None, true) => Some(None),
                (None, false) => None,
            };
            if status.is_none() && assignee_id.is_none() {
                return Err(eyre!("Nothing to change: pass --status, --assign or --unassign"));
            }

            let request = StatusUpdateRequest { status, assignee_id };
            let ticket = service.update_status(&Caller::new(actor), &id, &request)?;
            print_ticket(&ticket);
        }
        Commands::Timer { id, action } => {
            let ticket = service.toggle_timer(&id, &TimerToggleRequest { action })?;
            print_ticket(&ticket);
        }
        Commands::Sync => {
            println!("Syncing database from JSONL files...");
            service.store_mut().sync()?;
            println!("Sync complete");
        }
    }

    Ok(())
}

fn colored_status(status: TicketStatus) -> colored::ColoredString {
    match status {
        TicketStatus::Open => status.as_str().yellow(),
        TicketStatus::InProgress => status.as_str().cyan(),
        TicketStatus::Resolved => status.as_str().green(),
        TicketStatus::Closed => status.as_str().dimmed(),
    }
}

fn print_ticket(ticket: &Ticket) {
    println!("{} {}", ticket.id.bold(), ticket.title);
    println!("  status:        {}", colored_status(ticket.status));
    println!("  assignee:      {}", ticket.assignee_id.as_deref().unwrap_or("-"));
    if let Some(at) = ticket.in_progress_at {
        println!("  started:       {}", at.to_rfc3339());
    }
    if ticket.timer_paused {
        let since = ticket.timer_paused_at.map(|at| at.to_rfc3339()).unwrap_or_default();
        println!("  timer:         {} since {}", "paused".red(), since);
    }
    println!("  paused total:  {}s", ticket.total_paused_seconds);
    if let Some(at) = ticket.resolved_at {
        println!("  resolved:      {}", at.to_rfc3339());
    }
    if let Some(at) = ticket.closed_at {
        println!("  closed:        {}", at.to_rfc3339());
    }
    match (ticket.time_spent_minutes, ticket.status) {
        (Some(minutes), _) => println!("  time spent:    {} min", minutes),
        (None, TicketStatus::InProgress) => {
            if let Some(worked) = ticket.worked_seconds_at(Utc::now()) {
                println!("  worked so far: {} min", worked / 60);
            }
        }
        _ => {}
    }
}
