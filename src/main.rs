use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};

use haven::config::{parse_port, DEFAULT_PORT};
use haven::file_info::{human_size, short_date};
use haven::{
    server, Config, FallbackCache, FileClient, FileListSnapshot, ProbeTarget, Prober,
    ServerEndpoint, SnapshotSource, SyncOrchestrator,
};

fn cli() -> App<'static, 'static> {
    App::new("haven")
        .version(crate_version!())
        .about("Minimal file manager client")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("config")
                .long("config")
                .takes_value(true)
                .global(true)
                .help("JSON config file"),
        )
        .arg(
            Arg::with_name("server")
                .long("server")
                .takes_value(true)
                .global(true)
                .conflicts_with("port")
                .help("Server base URL, e.g. http://localhost:8080"),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .global(true)
                .help("Port of a server on localhost (1024-65535)"),
        )
        .arg(
            Arg::with_name("cache")
                .long("cache")
                .takes_value(true)
                .global(true)
                .help("File holding the fallback file list (default .haven/cache.json)"),
        )
        .subcommand(SubCommand::with_name("status").about("Check whether the server is up"))
        .subcommand(
            SubCommand::with_name("connect").about("Wait until the server answers, with retries"),
        )
        .subcommand(SubCommand::with_name("list").about("List files on the server"))
        .subcommand(
            SubCommand::with_name("upload")
                .about("Upload files")
                .arg(Arg::with_name("files").required(true).multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("Delete a file")
                .arg(Arg::with_name("name").required(true)),
        )
        .subcommand(
            SubCommand::with_name("download")
                .about("Download a file")
                .arg(Arg::with_name("name").required(true))
                .arg(
                    Arg::with_name("output")
                        .short("o")
                        .long("output")
                        .takes_value(true),
                ),
        )
        .subcommand(SubCommand::with_name("watch").about("Keep the file list in sync and print it"))
        .subcommand(
            SubCommand::with_name("serve")
                .about("Run the reference file server")
                .arg(
                    Arg::with_name("dir")
                        .long("dir")
                        .takes_value(true)
                        .default_value("files"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> haven::Result<Config> {
    let mut config = match matches.value_of("config") {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };
    if let Some(port) = matches.value_of("port") {
        config = config.with_port(parse_port(port)?);
    }
    if let Some(server) = matches.value_of("server") {
        config.server = server.to_string();
    }
    if let Some(cache) = matches.value_of("cache") {
        config.cache_file = Some(PathBuf::from(cache));
    }
    config.validate()?;
    Ok(config)
}

fn print_files(snapshot: &FileListSnapshot) {
    if snapshot.is_empty() {
        println!("No files uploaded yet");
        return;
    }
    for file in snapshot.iter() {
        println!(
            "{:>10}  {:<12}  {}",
            human_size(file.size),
            short_date(file),
            file.name
        );
    }
}

async fn run(matches: &ArgMatches<'_>) -> haven::Result<()> {
    let (command, sub) = matches.subcommand();
    let sub = sub.unwrap_or(matches);
    let config = load_config(sub)?;
    let cache = FallbackCache::for_config(&config);

    match command {
        "status" => {
            let prober = Prober::new(ProbeTarget::Status)?;
            let mut endpoint = ServerEndpoint::new(config.server.clone());
            if prober.probe(&mut endpoint, config.probe_timeout()).await {
                let status = FileClient::new(config.server.clone())?.status().await?;
                println!("{} is {} (server time {})", endpoint.base_url, status.status, status.time);
            } else {
                println!("{} is not reachable", endpoint.base_url);
            }
        }
        "connect" => {
            let prober = Prober::new(ProbeTarget::Files)?;
            let mut endpoint = ServerEndpoint::new(config.server.clone());
            prober
                .wait_until_reachable(
                    &mut endpoint,
                    config.probe_timeout(),
                    config.start_attempts,
                    config.start_interval(),
                )
                .await?;
            println!("Server ready at {}", endpoint.base_url);
        }
        "list" => {
            let client = FileClient::new(config.server.clone())?;
            match client.list().await {
                Ok(files) => {
                    cache.replace_all(&files)?;
                    print_files(&FileListSnapshot::from_records(files));
                }
                Err(err) => {
                    tracing::warn!("list files error: {}", err);
                    println!("Server unavailable, showing cached list");
                    print_files(&FileListSnapshot::from_records(cache.load_all()?));
                }
            }
        }
        "upload" => {
            let client = FileClient::new(config.server.clone())?;
            for path in sub.values_of("files").into_iter().flatten() {
                let record = client.upload_path(Path::new(path)).await?;
                cache.save(&record)?;
                println!("Uploaded {} ({})", record.name, human_size(record.size));
            }
        }
        "delete" => {
            let name = sub.value_of("name").unwrap_or_default();
            FileClient::new(config.server.clone())?.remove(name).await?;
            cache.remove(name)?;
            println!("{} deleted successfully", name);
        }
        "download" => {
            let name = sub.value_of("name").unwrap_or_default();
            let content = FileClient::new(config.server.clone())?
                .fetch_content(name)
                .await?;
            let output = sub.value_of("output").unwrap_or(name);
            tokio::fs::write(output, &content).await?;
            println!("Saved {} ({})", output, human_size(content.len() as u64));
        }
        "watch" => {
            let mut orchestrator = SyncOrchestrator::new(&config, cache)?;
            let mut views = orchestrator.subscribe();
            orchestrator.start().await;
            loop {
                {
                    let view = views.borrow_and_update();
                    let origin = match view.source {
                        SnapshotSource::Live => "live",
                        SnapshotSource::Cache => "cached",
                        SnapshotSource::Empty => "empty",
                    };
                    println!("[{:?}] {} file(s), {}", view.state, view.snapshot.len(), origin);
                    print_files(&view.snapshot);
                }
                tokio::select! {
                    changed = views.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            orchestrator.shutdown().await;
        }
        "serve" => {
            let port = match sub.value_of("port") {
                Some(port) => parse_port(port)?,
                None => DEFAULT_PORT,
            };
            let dir = PathBuf::from(sub.value_of("dir").unwrap_or("files"));
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            server::serve(addr, dir).await?;
        }
        _ => unreachable!("subcommand required"),
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let matches = cli().get_matches();
    if let Err(err) = run(&matches).await {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}
