//! Hands every recipient to an external checker and answers the MTA once
//! the checker exits: exit code 0 accepts the recipient, anything else
//! rejects it.

use log::info;
use milter_session::{ChildExit, Client, Context, Events, Filter, HandlerResult, WatchHandle};
use std::process::{Command, ExitCode, Stdio};

#[derive(Default)]
struct External {
    checker: String,
    pending: Option<(WatchHandle, String)>,
}

impl Filter for External {
    const EVENTS: Events = Events::ENVELOPE_RECIPIENT.union(Events::ABORT);

    fn envelope_recipient(
        &mut self,
        ctx: &mut Context<'_>,
        address: &str,
        _parameters: &[String],
    ) -> HandlerResult {
        let child = Command::new(&self.checker)
            .arg(address)
            .stdin(Stdio::null())
            .spawn()?;
        let handle = ctx.watch_child(child);
        self.pending = Some((handle, address.to_string()));
        ctx.delay_response();
        Ok(())
    }

    fn watch_completed(&mut self, ctx: &mut Context<'_>, handle: WatchHandle, exit: ChildExit) -> HandlerResult {
        let address = match self.pending.take() {
            Some((pending, address)) if pending == handle => address,
            _ => return Ok(()),
        };
        if exit?.success() {
            info!("{}: {address} accepted by checker", ctx.session_id());
            ctx.continue_processing();
        } else {
            ctx.reject_with(Some(550), Some("5.1.1"), Some("Recipient refused by checker"))?;
        }
        Ok(())
    }

    fn abort(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        if let Some((handle, _)) = self.pending.take() {
            ctx.cancel_watch(handle);
        }
        Ok(())
    }

    fn reset(&mut self) -> HandlerResult {
        self.pending = None;
        Ok(())
    }
}

fn main() -> ExitCode {
    let checker = std::env::var("MILTER_CHECKER").unwrap_or_else(|_| "true".to_string());
    milter_session::cli::cli(Client::register(move || External {
        checker: checker.clone(),
        pending: None,
    }))
}
