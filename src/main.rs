use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use pet_adoption::{
    config::{init_logging, Config},
    format_amount, parse_amount,
    runtime::CallOutcome,
    AccountId, Amount, Call, CallContext, ContractEvent, Runtime, RuntimeError,
};

#[derive(Parser)]
#[command(name = "adoption", version, about = "Pet adoption registry with donation awards")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Credit an account with coins out of thin air (genesis funding).
    Fund {
        #[arg(long)]
        account: AccountId,
        #[arg(long, value_parser = parse_amount)]
        amount: Amount,
    },
    /// Put a pet up for adoption; the caller becomes its owner.
    Register {
        #[arg(long)]
        caller: AccountId,
        name: String,
    },
    /// Take ownership of someone else's pet and earn one award credit.
    Adopt {
        #[arg(long)]
        caller: AccountId,
        name: String,
    },
    /// Send coins to the donation pool.
    Donate {
        #[arg(long)]
        caller: AccountId,
        #[arg(long, value_parser = parse_amount)]
        value: Amount,
    },
    /// Redeem one credit for half of the donation pool.
    Claim {
        #[arg(long)]
        caller: AccountId,
    },
    /// Show the current owner of a pet.
    Owner { name: String },
    /// List every pet with its owner, in registration order.
    List,
    /// Show the donation pool balance.
    Pool,
    /// Show unclaimed credits of an account.
    Credits { account: AccountId },
    /// Show the ledger balance of an account.
    Balance { account: AccountId },
    /// Print the call receipt log.
    Receipts,
    /// Print the state commitment.
    Root,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli.config)?;
    let config = cli.config;

    let mut runtime = Runtime::load_or_default(&config.state)
        .with_context(|| format!("loading {}", config.state.display()))?;

    let (ctx, call) = match cli.command {
        Command::Fund { account, amount } => {
            runtime.fund(&account, amount)?;
            save(&runtime, &config)?;
            let balance = runtime.ledger().balance_of(&account);
            print(
                &config,
                json!({ "account": account, "balance": balance.to_string() }).to_string(),
                format!("{account} balance: {}", format_amount(balance)),
            );
            return Ok(ExitCode::SUCCESS);
        }
        Command::Register { caller, name } => (CallContext::new(caller), Call::Register { name }),
        Command::Adopt { caller, name } => (CallContext::new(caller), Call::Adopt { name }),
        Command::Donate { caller, value } => (CallContext::new(caller).with_value(value), Call::Donate),
        Command::Claim { caller } => (CallContext::new(caller), Call::Claim),
        Command::Owner { name } => {
            return Ok(match runtime.contract().owner_of(&name) {
                Ok(owner) => {
                    print(&config, json!({ "name": name, "owner": owner }).to_string(), owner.clone());
                    ExitCode::SUCCESS
                }
                Err(err) => report_failure(&config, err.reason(), &err.to_string()),
            });
        }
        Command::List => {
            let pets: Vec<_> = runtime
                .contract()
                .list_all()
                .map(|(name, owner)| json!({ "name": name, "owner": owner }))
                .collect();
            let text = runtime
                .contract()
                .list_all()
                .map(|(name, owner)| format!("{name}\t{owner}"))
                .collect::<Vec<_>>()
                .join("\n");
            print(&config, json!(pets).to_string(), text);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Pool => {
            let balance = runtime.contract().pool_balance();
            print(
                &config,
                json!({ "pool": balance.to_string() }).to_string(),
                format_amount(balance),
            );
            return Ok(ExitCode::SUCCESS);
        }
        Command::Credits { account } => {
            let credits = runtime.contract().credits_of(&account);
            print(
                &config,
                json!({ "account": account, "credits": credits }).to_string(),
                credits.to_string(),
            );
            return Ok(ExitCode::SUCCESS);
        }
        Command::Balance { account } => {
            let balance = runtime.ledger().balance_of(&account);
            print(
                &config,
                json!({ "account": account, "balance": balance.to_string() }).to_string(),
                format_amount(balance),
            );
            return Ok(ExitCode::SUCCESS);
        }
        Command::Receipts => {
            let text = runtime
                .receipts()
                .iter()
                .map(|r| {
                    let status = match &r.outcome {
                        CallOutcome::Accepted { .. } => "ok".to_string(),
                        CallOutcome::Rejected { reason, .. } => {
                            format!("rejected:{reason}")
                        }
                    };
                    format!(
                        "{}\t{}\t{}\t{}\t{}",
                        r.sequence,
                        r.caller,
                        r.call.label(),
                        status,
                        hex::encode(r.digest)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            print(&config, serde_json::to_string(runtime.receipts())?, text);
            return Ok(ExitCode::SUCCESS);
        }
        Command::Root => {
            let root = hex::encode(runtime.state_root());
            print(&config, json!({ "state_root": root }).to_string(), root.clone());
            return Ok(ExitCode::SUCCESS);
        }
    };

    let result = runtime.execute(&ctx, call);
    // Rejected calls leave a receipt too, so the state is written either way.
    save(&runtime, &config)?;
    Ok(match result {
        Ok(events) => {
            let text = events.iter().map(describe).collect::<Vec<_>>().join("\n");
            print(&config, serde_json::to_string(&events)?, text);
            ExitCode::SUCCESS
        }
        Err(err) => report_revert(&config, &err),
    })
}

fn save(runtime: &Runtime, config: &Config) -> anyhow::Result<()> {
    runtime
        .save(&config.state)
        .with_context(|| format!("saving {}", config.state.display()))
}

fn print(config: &Config, json: String, text: String) {
    if config.json {
        println!("{json}");
    } else if !text.is_empty() {
        println!("{text}");
    }
}

fn report_revert(config: &Config, err: &RuntimeError) -> ExitCode {
    report_failure(config, err.reason(), &err.to_string())
}

fn report_failure(config: &Config, reason: &str, message: &str) -> ExitCode {
    if config.json {
        println!("{}", json!({ "error": reason, "message": message }));
    } else {
        eprintln!("error: {message}");
    }
    ExitCode::FAILURE
}

fn describe(event: &ContractEvent) -> String {
    match event {
        ContractEvent::PetRegistered { name, owner } => format!("{name} registered by {owner}"),
        ContractEvent::PetAdopted {
            name,
            previous_owner,
            new_owner,
        } => format!("{name} adopted by {new_owner} from {previous_owner}"),
        ContractEvent::DonationReceived { donor, amount } => {
            format!("{donor} donated {}", format_amount(*amount))
        }
        ContractEvent::AwardClaimed { claimant, amount } => {
            format!("{claimant} claimed {}", format_amount(*amount))
        }
    }
}
