use clap::Parser;

/// Local reverse proxy that serves the Anthropic Messages API on loopback
/// and forwards to whichever provider hosts the requested model.
#[derive(Debug, Parser)]
#[command(name = "claudish", version, about)]
pub struct Args {
    /// Port to bind on 127.0.0.1. 0 picks a free port.
    #[arg(long, short, env = "CLAUDISH_PORT", default_value_t = 0)]
    pub port: u16,

    /// Serve this model regardless of what the client asks for.
    #[arg(long, short)]
    pub model: Option<String>,

    /// Observer mode: pass every request through to Anthropic untouched.
    #[arg(long, default_value_t = false)]
    pub observer: bool,

    /// Model substituted when the client asks for an Opus tier.
    #[arg(long)]
    pub map_opus: Option<String>,

    /// Model substituted when the client asks for a Sonnet tier.
    #[arg(long)]
    pub map_sonnet: Option<String>,

    /// Model substituted when the client asks for a Haiku tier.
    #[arg(long)]
    pub map_haiku: Option<String>,

    /// Log filter, e.g. `info` or `proxy=debug`.
    #[arg(long, env = "CLAUDISH_LOG", default_value = "info")]
    pub log_filter: String,
}

impl Args {
    pub fn router_options(&self) -> proxy::RouterOptions {
        proxy::RouterOptions {
            observer: self.observer,
            override_model: self.model.clone(),
            profile: proxy::ProfileMap {
                opus: self.map_opus.clone(),
                sonnet: self.map_sonnet.clone(),
                haiku: self.map_haiku.clone(),
            },
        }
    }
}
