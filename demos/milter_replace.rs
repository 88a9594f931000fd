//! Rewrites every occurrence of "milter" to "MILTER" in header values and
//! in the body.

use lazy_regex::{Lazy, Regex, lazy_regex};
use milter_session::{Actions, Client, Context, Events, Filter, HandlerResult};
use std::collections::HashMap;
use std::process::ExitCode;

static PATTERN: Lazy<Regex> = lazy_regex!("(?i)milter");
const REPLACEMENT: &str = "MILTER";

#[derive(Default)]
struct Replace {
    headers: Vec<(String, u32, String)>,
    occurrences: HashMap<String, u32>,
    body: Vec<u8>,
}

impl Filter for Replace {
    const EVENTS: Events = Events::HEADER.union(Events::BODY);
    const ACTIONS: Actions = Actions::CHANGE_HEADERS.union(Actions::CHANGE_BODY);

    fn header(&mut self, _ctx: &mut Context<'_>, name: &str, value: &str) -> HandlerResult {
        let index = self
            .occurrences
            .entry(name.to_ascii_lowercase())
            .and_modify(|n| *n += 1)
            .or_insert(1);
        self.headers.push((name.to_string(), *index, value.to_string()));
        Ok(())
    }

    fn body(&mut self, _ctx: &mut Context<'_>, chunk: &[u8]) -> HandlerResult {
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    fn end_of_message(&mut self, ctx: &mut Context<'_>) -> HandlerResult {
        for (name, index, value) in &self.headers {
            if PATTERN.is_match(value) {
                ctx.change_header(name, *index, &PATTERN.replace_all(value, REPLACEMENT))?;
            }
        }
        let body = String::from_utf8_lossy(&self.body);
        if PATTERN.is_match(&body) {
            ctx.replace_body(PATTERN.replace_all(&body, REPLACEMENT).as_bytes())?;
        }
        Ok(())
    }

    fn reset(&mut self) -> HandlerResult {
        *self = Replace::default();
        Ok(())
    }
}

fn main() -> ExitCode {
    milter_session::cli::cli(Client::register(Replace::default))
}
