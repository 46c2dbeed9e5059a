//! Kiosk CLI - Database migrations and order overrides.
//!
//! # Usage
//!
//! ```bash
//! # Run database migrations
//! kiosk migrate
//!
//! # Re-apply a processor payment to an order
//! kiosk orders sync-payment -o <order-id> -p 1234567890
//!
//! # Confirm an order as paid without a processor payment
//! kiosk orders mark-paid -o <order-id>
//!
//! # Move an order along its status machine
//! kiosk orders set-status -o <order-id> -s shipped
//!
//! # Cancel expired unpaid orders now
//! kiosk orders sweep
//! ```
//!
//! # Commands
//!
//! - `migrate` - Run database migrations
//! - `orders` - Admin overrides on orders

#![cfg_attr(not(test), forbid(unsafe_code))]

use clap::{Parser, Subcommand};

use kiosk_core::{OrderId, OrderStatus};

mod commands;

#[derive(Parser)]
#[command(name = "kiosk")]
#[command(author, version, about = "Kiosk operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Admin overrides on orders
    Orders {
        #[command(subcommand)]
        action: OrderAction,
    },
}

#[derive(Subcommand)]
enum OrderAction {
    /// Fetch a payment from the processor and apply it to an order
    SyncPayment {
        /// Order ID
        #[arg(short, long)]
        order: OrderId,

        /// Processor payment ID
        #[arg(short, long)]
        payment: String,
    },
    /// Confirm an order as paid (decrements stock, clears the cart)
    MarkPaid {
        /// Order ID
        #[arg(short, long)]
        order: OrderId,

        /// Payment reference; defaults to `manual-<unix millis>`
        #[arg(short, long)]
        payment: Option<String>,
    },
    /// Change an order's status (`confirmed`, `shipped`, `delivered`, `cancelled`)
    SetStatus {
        /// Order ID
        #[arg(short, long)]
        order: OrderId,

        /// Target status
        #[arg(short, long)]
        status: OrderStatus,
    },
    /// Run one expiration sweep now
    Sweep,
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result: Result<(), Box<dyn std::error::Error>> = run(cli).await;

    if let Err(e) = result {
        tracing::error!("Command failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Migrate => commands::migrate::run().await?,
        Commands::Orders { action } => {
            let ctx = commands::orders::Context::from_env().await?;
            match action {
                OrderAction::SyncPayment { order, payment } => {
                    ctx.sync_payment(order, &payment).await?;
                }
                OrderAction::MarkPaid { order, payment } => ctx.mark_paid(order, payment).await?,
                OrderAction::SetStatus { order, status } => ctx.set_status(order, status).await?,
                OrderAction::Sweep => ctx.sweep().await?,
            }
        }
    }
    Ok(())
}
