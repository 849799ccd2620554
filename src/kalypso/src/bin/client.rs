use clap::{App, Arg};
use kalypso::client::{Client, ClientError, Protocol};
use kalypso_contract::Tensor;
use std::process;

const LINE: &str = "============================================================";

async fn run(
    client: &mut Client,
    model: &str,
    batch_size: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("\n[1] Checking server health...");
    let live = client.server_live().await?;
    let ready = client.server_ready().await?;
    println!("Server Live: {}", live);
    println!("Server Ready: {}", ready);
    if !(live && ready) {
        return Err("server is not ready".into());
    }

    println!("\n[2] Checking model '{}' status...", model);
    let model_ready = client.model_ready(model).await?;
    println!("Model '{}' Ready: {}", model, model_ready);
    if !model_ready {
        return Err(format!("model '{}' is not ready", model).into());
    }

    println!("\n[3] Getting model metadata...");
    match client.model_metadata(model).await {
        Ok(metadata) => {
            println!("\nModel Metadata for '{}':", model);
            println!("  Name: {}", metadata.name);
            println!("  Versions: {:?}", metadata.versions);
            let describe = |tensors: &[kalypso::json::TensorMetadata]| {
                tensors
                    .iter()
                    .map(|t| format!("({}, {}, {:?})", t.name, t.datatype, t.shape))
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            println!("  Inputs: [{}]", describe(&metadata.inputs));
            println!("  Outputs: [{}]", describe(&metadata.outputs));
        }
        Err(err) => println!("Failed to get model metadata: {}", err),
    }

    println!("\n[4] Preparing input data...");
    let row0 = [1f32, 2., 3., 4.];
    let row1 = [4f32, 3., 2., 1.];
    let shape = vec![batch_size as i64, 4];
    let input0: Vec<f32> = row0.iter().cycle().take(4 * batch_size).copied().collect();
    let input1: Vec<f32> = row1.iter().cycle().take(4 * batch_size).copied().collect();
    let inputs = vec![
        Tensor::from_slice("INPUT0", shape.clone(), &input0)?,
        Tensor::from_slice("INPUT1", shape.clone(), &input1)?,
    ];
    println!("INPUT0 shape: {:?}", shape);
    println!("INPUT0 data: {:?}", row0);
    println!("INPUT1 shape: {:?}", shape);
    println!("INPUT1 data: {:?}", row1);

    println!("\n[5] Performing inference...");
    let outputs = client.infer(model, &inputs, &["OUTPUT0", "OUTPUT1"]).await?;
    let output = |name: &str| -> Result<Vec<f32>, ClientError> {
        match outputs.iter().find(|t| t.name() == name) {
            Some(t) => Ok(t.to_vec::<f32>()?),
            None => Err(ClientError::Server {
                status: 0,
                message: format!("response has no {}", name),
            }),
        }
    };
    let output0 = output("OUTPUT0")?;
    let output1 = output("OUTPUT1")?;

    println!("\n{}", LINE);
    println!("INFERENCE RESULTS");
    println!("{}", LINE);
    println!("INPUT0:  {:?}", row0);
    println!("INPUT1:  {:?}", row1);
    println!("{}", "-".repeat(LINE.len()));
    println!("OUTPUT0 (INPUT0 + INPUT1): {:?}", &output0[..4.min(output0.len())]);
    println!("OUTPUT1 (INPUT0 - INPUT1): {:?}", &output1[..4.min(output1.len())]);
    println!("{}", LINE);

    let expected_add: Vec<f32> = row0.iter().zip(&row1).map(|(a, b)| a + b).collect();
    let expected_sub: Vec<f32> = row0.iter().zip(&row1).map(|(a, b)| a - b).collect();
    let close = |got: &[f32], want: &[f32]| {
        got.len() >= want.len()
            && got
                .iter()
                .zip(want)
                .all(|(a, b)| (a - b).abs() <= 1e-5 + 1e-8 * b.abs())
    };
    if close(&output0, &expected_add) && close(&output1, &expected_sub) {
        println!("\nInference successful! Results are correct.");
    } else {
        println!("\nInference completed but results don't match expected values.");
        println!("Expected OUTPUT0: {:?}", expected_add);
        println!("Expected OUTPUT1: {:?}", expected_sub);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = App::new("Kalypso Client")
        .about("Checks a Kalypso server and runs the add_sub model")
        .arg(
            Arg::with_name("protocol")
                .short("p")
                .long("protocol")
                .help("Protocol to use for inference")
                .possible_values(&["http", "grpc"])
                .default_value("http")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .help("Server host")
                .default_value("localhost")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .help("Server port, 8000 for http and 8001 for grpc by default")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("model")
                .short("m")
                .long("model")
                .help("Model name to use for inference")
                .default_value("add_sub")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("batch_size")
                .short("b")
                .long("batch-size")
                .help("Batch size for inference")
                .default_value("1")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("compress")
                .long("compress")
                .help("lz4 compress tensor buffers (grpc only)"),
        )
        .get_matches();

    let protocol: Protocol = match matches.value_of("protocol").unwrap_or("http").parse() {
        Ok(protocol) => protocol,
        Err(err) => {
            println!("{}", err);
            process::exit(1);
        }
    };
    let port = match matches.value_of("port").map(str::parse::<u16>) {
        Some(Ok(port)) => port,
        Some(Err(err)) => {
            println!("Invalid port: {}", err);
            process::exit(1);
        }
        None => protocol.default_port(),
    };
    let batch_size = match matches.value_of("batch_size").unwrap_or("1").parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => {
            println!("Batch size must be a positive integer");
            process::exit(1);
        }
    };
    let host = matches.value_of("host").unwrap_or("localhost");
    let model = matches.value_of("model").unwrap_or("add_sub");

    println!("{}", LINE);
    println!("Kalypso Inference Client");
    println!("{}", LINE);
    println!("Protocol: {}", protocol);
    println!("Server: {}:{}", host, port);
    println!("Model: {}", model);
    println!("Batch Size: {}", batch_size);
    println!("{}", LINE);

    let mut client =
        match Client::connect(protocol, host, port, matches.is_present("compress")).await {
            Ok(client) => client,
            Err(err) => {
                println!("Failed to create client: {}", err);
                process::exit(1);
            }
        };
    if let Err(err) = run(&mut client, model, batch_size).await {
        println!("\nInference failed: {}", err);
        process::exit(1);
    }
}
