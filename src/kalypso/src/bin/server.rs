#![deny(warnings)]
use add_sub::ModelRepository;
use clap::{App, Arg, ArgMatches};
use dispatcher::{Builder, OverloadPolicy, VersionPolicy};
use kalypso::{grpc, http, observability};
use std::{error::Error, net::SocketAddr, time::Duration};
use tokio::net::TcpListener;

type BoxError = Box<dyn Error + Send + Sync>;

fn parse_duration(s: &str) -> Result<Duration, BoxError> {
    let duration = if let Some(idx) = s.find("ns") {
        Duration::from_nanos(s[..idx].parse()?)
    } else if let Some(idx) = s.find("us") {
        Duration::from_micros(s[..idx].parse()?)
    } else if let Some(idx) = s.find("ms") {
        Duration::from_millis(s[..idx].parse()?)
    } else if let Some(idx) = s.find('s') {
        Duration::from_secs(s[..idx].parse()?)
    } else {
        return Err(format!("can't parse {} to duration, use value[s|ms|us|ns]", s).into());
    };
    Ok(duration)
}

fn builder(matches: &ArgMatches) -> Result<Builder, BoxError> {
    let max_concurrency = match matches.value_of("max_concurrency") {
        Some(n) => Some(n.parse()?),
        None => None,
    };
    let overload_policy = match matches.value_of("overload_policy") {
        Some("queue") => OverloadPolicy::Queue,
        _ => OverloadPolicy::Reject,
    };
    let queue_timeout = match matches.value_of("queue_timeout") {
        Some(s) => Some(parse_duration(s)?),
        None => None,
    };
    let default_version = match matches.value_of("default_version") {
        Some("latest") | None => VersionPolicy::Latest,
        Some(v) => VersionPolicy::Pinned(v.parse()?),
    };
    let repository = match matches.value_of("models") {
        Some(path) => ModelRepository::from_path(path)?,
        None => ModelRepository::default(),
    };

    let mut builder = Builder::new()
        .max_concurrent_requests_per_version(max_concurrency)
        .overload_policy(overload_policy)
        .queue_timeout(queue_timeout)
        .require_all_models_ready(matches.is_present("require_all_models_ready"))
        .default_model_version(default_version);
    for info in repository.model_infos()? {
        builder = builder.register_model(info);
    }
    Ok(builder)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let matches = App::new("Kalypso Server")
        .about("Serves models over HTTP/JSON and gRPC")
        .arg(
            Arg::with_name("http_addr")
                .long("http-addr")
                .help("HTTP listen address")
                .default_value("0.0.0.0:8000")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("grpc_addr")
                .long("grpc-addr")
                .help("gRPC listen address")
                .default_value("0.0.0.0:8001")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("metrics_addr")
                .long("metrics-addr")
                .help("Prometheus metrics listen address")
                .default_value("0.0.0.0:8002")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("disable_metrics")
                .long("disable-metrics")
                .help("Do not start the metrics service"),
        )
        .arg(
            Arg::with_name("max_input_bytes")
                .long("max-input-bytes")
                .help("Largest decompressed gRPC input tensor in bytes")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("models")
                .short("m")
                .long("models")
                .help("Path to a JSON model repository, serves the add_sub demo when omitted")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("max_concurrency")
                .short("c")
                .long("max-concurrency")
                .help("Concurrent executions per model version, 0 for unlimited")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("overload_policy")
                .long("overload-policy")
                .help("What to do with requests beyond max-concurrency")
                .possible_values(&["reject", "queue"])
                .default_value("reject")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("queue_timeout")
                .short("t")
                .long("queue-timeout")
                .help("Longest a queued request waits, use value[s|ms|us|ns], e.g. 100ms")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("require_all_models_ready")
                .long("require-all-models-ready")
                .help("Report ready only when every model has a ready version"),
        )
        .arg(
            Arg::with_name("default_version")
                .long("default-version")
                .help("Version used when a request names none, latest or a number")
                .default_value("latest")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("disable_http")
                .long("disable-http")
                .help("Do not start the HTTP service"),
        )
        .arg(
            Arg::with_name("disable_grpc")
                .long("disable-grpc")
                .help("Do not start the gRPC service"),
        )
        .get_matches();

    let mut logger = env_logger::Builder::from_default_env();
    logger.format_timestamp_micros().init();

    let http_enabled = !matches.is_present("disable_http");
    let grpc_enabled = !matches.is_present("disable_grpc");
    if !http_enabled && !grpc_enabled {
        return Err("both HTTP and gRPC are disabled, nothing to serve".into());
    }
    let http_addr: SocketAddr = matches.value_of("http_addr").unwrap_or_default().parse()?;
    let grpc_addr: SocketAddr = matches.value_of("grpc_addr").unwrap_or_default().parse()?;
    let metrics_addr: SocketAddr = matches.value_of("metrics_addr").unwrap_or_default().parse()?;
    let max_input_bytes = match matches.value_of("max_input_bytes") {
        Some(n) => n.parse()?,
        None => grpc::DEFAULT_MAX_INPUT_BYTES,
    };

    let metrics = if matches.is_present("disable_metrics") {
        None
    } else {
        Some((observability::install()?, TcpListener::bind(metrics_addr).await?))
    };
    let frontend = builder(&matches)?.build();
    let http_listener = if http_enabled {
        Some(TcpListener::bind(http_addr).await?)
    } else {
        None
    };
    let grpc_listener = if grpc_enabled {
        Some(TcpListener::bind(grpc_addr).await?)
    } else {
        None
    };

    let http_service = {
        let frontend = frontend.clone();
        async move {
            match http_listener {
                Some(listener) => http::serve(listener, frontend).await.map_err(BoxError::from),
                None => Ok(()),
            }
        }
    };
    let grpc_service = {
        let service = grpc::Service::new(frontend.clone()).max_input_bytes(max_input_bytes);
        async move {
            match grpc_listener {
                Some(listener) => grpc::serve(listener, service).await.map_err(BoxError::from),
                None => Ok(()),
            }
        }
    };
    let metrics_service = async move {
        match metrics {
            Some((handle, listener)) => observability::serve(listener, handle)
                .await
                .map_err(BoxError::from),
            None => Ok(()),
        }
    };

    // every listener is bound at this point
    frontend.health.mark_live();
    tokio::select! {
        result = async { tokio::try_join!(http_service, grpc_service, metrics_service) } => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down, draining models");
        }
    }

    let registry = frontend.registry.clone();
    tokio::task::spawn_blocking(move || {
        let mut names: Vec<String> = registry.index().into_iter().map(|(name, _, _)| name).collect();
        names.dedup();
        for name in names {
            match registry.unload_model(&name) {
                Ok(tickets) => tickets.into_iter().for_each(|ticket| ticket.wait()),
                Err(err) => log::warn!("Unloading {} failed: {}", name, err),
            }
        }
    })
    .await?;
    Ok(())
}
