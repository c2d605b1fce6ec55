use std::{str::FromStr, sync::Once};

use logforth::{append::Stderr, filter::EnvFilter};

use crate::args::Args;

static INIT: Once = Once::new();

/// Installs the stderr logger.
///
/// The filter string accepts the usual env-filter syntax: a plain level
/// (`info`, `debug`) or per-target directives (`proxy=debug,claudish=info`).
pub fn init(args: &Args) {
    let log_filter = args.log_filter.clone();

    INIT.call_once(move || {
        logforth::builder()
            .dispatch(move |dispatch| {
                let filter = EnvFilter::from_str(&log_filter)
                    .unwrap_or_else(|_| EnvFilter::from_str("info").expect("default filter should be valid"));

                dispatch.filter(filter).append(Stderr::default())
            })
            .apply();
    });
}
