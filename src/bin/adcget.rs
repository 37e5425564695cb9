//! adcget - downloads files from ADC hubs, magnet links and http(s) URLs.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tiger::{Digest, Tiger};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use radc::constants::{CLIENT_APP, CLIENT_VERSION};
use radc::net;
use radc::{
    ClientConfig, Download, DownloadConfig, FieldMap, HubClient, HubUrl, Identifier, MagnetLink,
    Search,
};

#[derive(Parser, Debug)]
#[command(
    name = "adcget",
    version,
    about = "Downloads files from ADC hubs, magnet links and http(s) URLs"
)]
struct Args {
    /// Magnet link or adc/adcs/http(s) URL, quoted.
    url: String,

    /// Output path; defaults to the link's display name.
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Seconds to wait for the first usable search result.
    #[clap(long, default_value_t = 8)]
    timeout: u64,

    /// Request compressed transfers from peers that support them.
    #[clap(long)]
    compress: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("adcget: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    if args.url.starts_with("http://") || args.url.starts_with("https://") {
        return fetch_http(&args).await;
    }

    // A magnet link names the hub in xs; a bare adc url may embed the
    // same dn/xt/xl fields in its own query.
    let (magnet, hub_url) = if args.url.starts_with("magnet:?") {
        let magnet = MagnetLink::parse(&args.url)?;
        let source = magnet
            .source
            .clone()
            .ok_or("magnet link has no hub address (append &xs=adc://host:port)")?;
        let hub_url = HubUrl::parse(&source)?;
        (magnet, hub_url)
    } else {
        let hub_url = HubUrl::parse(&args.url)?;
        let magnet = hub_url.embedded_magnet()?;
        (magnet, hub_url)
    };

    let output = args
        .output
        .clone()
        .or_else(|| magnet.display_name.clone().map(PathBuf::from))
        .ok_or("no output filename: pass --output or a dn= parameter")?;
    let hash = magnet
        .tree_hash
        .clone()
        .ok_or("no tree hash in url (need xt=urn:tree:tiger:...)")?;

    let session = net::dial(&hub_url).await?;
    let (client, mut errors) = HubClient::connect(
        session,
        ClientConfig {
            pid: host_private_id(),
            info: client_info(hub_url.username.as_deref()),
            password: hub_url.password.clone(),
        },
    )
    .await?;

    let (search, results) = Search::new();
    search.tree_hash(&hash);
    search.clone().send(&client).await?;

    let download = Download::new(DownloadConfig {
        output,
        hash: Some(hash),
        compress: args.compress,
        verify: true,
    });

    let progress = {
        let download = download.clone();
        tokio::spawn(async move {
            loop {
                let (done, total) = download.progress();
                if total > 0 {
                    eprint!("\r{done}/{total}");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        })
    };

    let started = std::time::Instant::now();
    let outcome = tokio::select! {
        outcome = download.clone().run(client.clone(), results, Duration::from_secs(args.timeout)) => outcome,
        error = errors.recv() => match error {
            Some(e) => Err(e.into()),
            None => Err(radc::DownloadError::Closed),
        },
    };
    progress.abort();
    client.unregister_token_handler("RES", search.token());
    client.close();

    let total = outcome?;
    eprintln!("\nDownloaded {total} bytes in {:.1?}", started.elapsed());
    Ok(())
}

/// Identity fields sent in our BINF. We never share outward, so the
/// share statistics are zero and no slots are offered.
fn client_info(username: Option<&str>) -> FieldMap {
    let nick = username
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| CLIENT_APP.to_string());

    let mut info = FieldMap::new();
    info.insert("NI".to_string(), nick);
    info.insert("AP".to_string(), CLIENT_APP.to_string());
    info.insert("VE".to_string(), CLIENT_VERSION.to_string());
    info.insert("SS".to_string(), "0".to_string());
    info.insert("SF".to_string(), "0".to_string());
    info.insert("SL".to_string(), "0".to_string());
    info.insert("CT".to_string(), "64".to_string());
    info
}

/// Derives a stable private identifier from the host identity, falling
/// back to randomness when the environment gives us nothing to hash.
fn host_private_id() -> Identifier {
    let hostname = std::env::var("HOSTNAME").unwrap_or_default();
    let user = std::env::var("USER").unwrap_or_default();
    if hostname.is_empty() && user.is_empty() {
        return Identifier::private(&rand::random::<[u8; 24]>());
    }
    let mut hasher = Tiger::new();
    hasher.update(hostname.as_bytes());
    hasher.update(user.as_bytes());
    Identifier::private(&hasher.finalize())
}

/// Plain http(s) fallback: stream the response body to the output file.
async fn fetch_http(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let output = match &args.output {
        Some(path) => path.clone(),
        None => {
            let name = args
                .url
                .split('?')
                .next()
                .unwrap_or(&args.url)
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .ok_or("cannot derive a filename from the url; pass --output")?;
            PathBuf::from(name)
        }
    };

    let mut response = reqwest::get(&args.url).await?.error_for_status()?;
    let total = response.content_length().unwrap_or(0);

    let mut file = tokio::fs::File::create(&output).await?;
    let mut done = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        done += chunk.len() as u64;
        if total > 0 {
            eprint!("\r{done}/{total}");
        }
    }
    file.flush().await?;
    eprintln!();
    Ok(())
}
