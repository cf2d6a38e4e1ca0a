use anyhow::anyhow;
use clap::arg;
use payorch::provider::sandbox::SandboxProvider;
use payorch::provider::types::{CreatePayoutRequest, CreateSubscriptionRequest};
use payorch::provider::ProviderEntry;
use payorch::{
    ChargeRequest, Context, ListPaymentsRequest, PaymentOrchestrator, RefundRequest,
};
use rustyline::highlight::Highlighter;
use rustyline::hint::HistoryHinter;
use rustyline::{Completer, Helper, Hinter, Validator};
use serde::Serialize;
use serde_json::to_string_pretty;
use std::borrow::Cow;
use std::borrow::Cow::Owned;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for one shell command against the providers
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// In-process providers backing the shell
pub(crate) struct Sandboxes {
    providers: Vec<Arc<SandboxProvider>>,
}

impl Sandboxes {
    pub(crate) fn new() -> Self {
        Self {
            providers: vec![
                Arc::new(SandboxProvider::full_featured("stripe", ["USD", "EUR", "GBP"])),
                Arc::new(SandboxProvider::full_featured(
                    "xendit",
                    ["IDR", "PHP", "VND", "THB", "MYR"],
                )),
                Arc::new(SandboxProvider::full_featured("razorpay", ["INR", "USD"])),
            ],
        }
    }

    pub(crate) fn entries(&self) -> Vec<ProviderEntry> {
        self.providers.iter().map(SandboxProvider::entry).collect()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.providers
            .iter()
            .map(|p| payorch::PaymentProvider::name(p.as_ref()).to_string())
            .collect()
    }

    fn get(&self, name: &str) -> Result<&Arc<SandboxProvider>, anyhow::Error> {
        self.providers
            .iter()
            .find(|p| payorch::PaymentProvider::name(p.as_ref()) == name)
            .ok_or_else(|| anyhow!("Unknown provider: {name}"))
    }
}

#[derive(Clone, clap::clap_derive::Parser)]
pub(crate) enum Commands {
    /// Charge a customer through the provider routed for the currency
    Charge {
        /// Amount in minor units
        #[arg(short, long)]
        amount: u64,

        /// ISO currency code
        #[arg(short, long)]
        currency: String,

        /// Payment method token (pm_card_declined and pm_card_3ds_required simulate outcomes)
        #[arg(short = 'm', long, default_value = "pm_card_visa")]
        payment_method: String,

        #[arg(long, default_value = "cus_cli")]
        customer: String,

        /// Provider to try before the routed one
        #[arg(short, long)]
        provider: Option<String>,

        /// Idempotency key, repeated charges with the same key are replayed
        #[arg(short, long)]
        key: Option<String>,

        /// Authorize only, capture later
        #[arg(long)]
        manual_capture: bool,

        #[arg(short, long)]
        description: Option<String>,
    },

    /// Refund a successful payment through the provider that charged it
    Refund {
        payment_id: String,

        /// Amount in minor units, the full payment amount when omitted
        #[arg(short, long)]
        amount: Option<u64>,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Capture an authorized payment
    Capture {
        payment_id: String,

        #[arg(short, long)]
        amount: Option<u64>,
    },

    /// Release an authorized payment
    Void { payment_id: String },

    /// Refresh a payment's status from its provider
    Sync { payment_id: String },

    GetPayment { payment_id: String },

    /// List payments
    ListPayments {
        /// Number of payments to show
        #[arg(short, long, default_value = "10")]
        limit: u32,

        /// Number of payments to skip
        #[arg(short, long, default_value = "0")]
        offset: u32,
    },

    ListRefunds { payment_id: String },

    /// Probe providers and show their capabilities
    Providers {},

    /// Take a sandbox provider down or bring it back
    SetAvailable {
        provider: String,

        #[arg(long)]
        down: bool,
    },

    /// Show the currency routing table
    Routes {},

    /// Route a currency to a provider
    SetRoute { currency: String, provider: String },

    /// Show circuit breaker states
    Breakers {
        /// Close every breaker
        #[arg(long)]
        reset: bool,
    },

    /// Subscribe a customer to a plan
    Subscribe {
        #[arg(long, default_value = "cus_cli")]
        customer: String,

        #[arg(short, long)]
        plan: String,

        #[arg(short, long)]
        currency: String,
    },

    /// Pay out to an external destination
    Payout {
        #[arg(short, long)]
        amount: u64,

        #[arg(short, long)]
        currency: String,

        #[arg(short, long)]
        destination: String,

        #[arg(long, default_value = "cus_cli")]
        customer: String,
    },

    /// Exit the interactive shell (interactive mode only)
    #[command(hide = true)]
    Exit {},
}

#[derive(Helper, Completer, Hinter, Validator)]
pub(crate) struct CliHelper {
    #[rustyline(Hinter)]
    pub(crate) hinter: HistoryHinter,
}

impl Highlighter for CliHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Owned("\x1b[1m".to_owned() + hint + "\x1b[m")
    }
}

#[derive(Serialize)]
pub(crate) struct CommandResult<T: Serialize> {
    pub success: bool,
    pub message: T,
}

macro_rules! command_result {
    ($expr:expr) => {{
        to_string_pretty(&CommandResult {
            success: true,
            message: $expr,
        })?
    }};
}

macro_rules! wait_confirmation {
    ($prompt:expr,$result:expr) => {
        print!("{}", $prompt);
        std::io::stdout().flush()?;

        let mut buf = String::new();
        std::io::stdin().read_line(&mut buf)?;
        if !buf.trim_start().starts_with(['y', 'Y']) {
            return Ok(command_result!($result));
        }
    };
}

pub(crate) async fn execute_command(
    command: Commands,
    orchestrator: &PaymentOrchestrator,
    sandboxes: &Sandboxes,
) -> Result<String, anyhow::Error> {
    let ctx = Context::background().with_timeout(COMMAND_TIMEOUT);
    Ok(match command {
        Commands::Charge {
            amount,
            currency,
            payment_method,
            customer,
            provider,
            key,
            manual_capture,
            description,
        } => {
            let mut request = ChargeRequest::new(amount, &currency, &payment_method, &customer);
            request.preferred_provider = provider;
            request.idempotency_key = key;
            request.manual_capture = manual_capture;
            request.description = description;
            let outcome = orchestrator.create_charge(&ctx, request).await?;
            command_result!(outcome)
        }
        Commands::Refund {
            payment_id,
            amount,
            reason,
        } => {
            let payment = orchestrator.get_payment(&payment_id)?;
            let amount = amount.unwrap_or(payment.amount);
            wait_confirmation!(
                format!(
                    "Refunding {} {} of payment {} via {}\nDo you want to proceed? (y/n): ",
                    amount, payment.currency, payment.id, payment.provider
                ),
                "Refund cancelled by user."
            );
            let refund = orchestrator
                .create_refund(
                    &ctx,
                    RefundRequest {
                        payment_id,
                        amount,
                        reason,
                    },
                )
                .await?;
            command_result!(refund)
        }
        Commands::Capture { payment_id, amount } => {
            let payment = orchestrator
                .capture_payment(&ctx, &payment_id, amount)
                .await?;
            command_result!(payment)
        }
        Commands::Void { payment_id } => {
            let payment = orchestrator.void_payment(&ctx, &payment_id).await?;
            command_result!(payment)
        }
        Commands::Sync { payment_id } => {
            let payment = orchestrator
                .payments()
                .sync_payment_status(&ctx, &payment_id)
                .await?;
            command_result!(payment)
        }
        Commands::GetPayment { payment_id } => {
            command_result!(orchestrator.get_payment(&payment_id)?)
        }
        Commands::ListPayments { limit, offset } => {
            let payments = orchestrator.list_payments(&ListPaymentsRequest { offset, limit })?;

            println!("Recent payments:");
            println!(
                "{:<38} {:<10} {:<16} {:>12} {:<5} Date",
                "ID", "Provider", "Status", "Amount", "Cur"
            );
            println!("{}", "-".repeat(100));

            for payment in payments {
                let date = chrono::DateTime::from_timestamp(payment.created_at, 0)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "Unknown".to_string());

                println!(
                    "{:<38} {:<10} {:<16} {:>12} {:<5} {}",
                    &payment.id,
                    payment.provider,
                    payment.status.to_string(),
                    payment.amount,
                    payment.currency,
                    date
                );
            }
            "".to_string()
        }
        Commands::ListRefunds { payment_id } => {
            command_result!(orchestrator.list_refunds(&payment_id)?)
        }
        Commands::Providers {} => {
            command_result!(orchestrator.provider_statuses().await)
        }
        Commands::SetAvailable { provider, down } => {
            sandboxes.get(&provider)?.set_available(!down);
            command_result!(format!(
                "{provider} is now {}",
                if down { "down" } else { "up" }
            ))
        }
        Commands::Routes {} => {
            let routes: HashMap<String, String> = orchestrator.selector().routing_table();
            command_result!(routes)
        }
        Commands::SetRoute { currency, provider } => {
            orchestrator.selector().set_route(&currency, &provider)?;
            command_result!(format!("{} routed to {provider}", currency.to_uppercase()))
        }
        Commands::Breakers { reset } => {
            if reset {
                orchestrator.payments().breakers().reset_all();
            }
            command_result!(orchestrator.breaker_stats())
        }
        Commands::Subscribe {
            customer,
            plan,
            currency,
        } => {
            let subscription = orchestrator
                .selector()
                .create_subscription(&CreateSubscriptionRequest {
                    customer_id: customer,
                    plan_id: plan,
                    currency,
                    trial_days: None,
                    idempotency_key: None,
                    metadata: HashMap::new(),
                })
                .await?;
            command_result!(subscription)
        }
        Commands::Payout {
            amount,
            currency,
            destination,
            customer,
        } => {
            let payout = orchestrator
                .selector()
                .create_payout(&CreatePayoutRequest {
                    customer_id: customer,
                    amount,
                    currency,
                    destination,
                    idempotency_key: None,
                })
                .await?;
            command_result!(payout)
        }
        Commands::Exit {} => {
            command_result!("Exiting...")
        }
    })
}
