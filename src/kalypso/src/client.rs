//! Client for both protocols, used by `kalypso-client` and the tests.
use crate::{
    grpc::{self, grpc_inference_service_client::GrpcInferenceServiceClient, model_infer_request},
    json::{
        ErrorBody, InferRequestBody, InferResponseBody, JsonError, JsonTensor, ModelMetadataBody,
        RequestedOutput, TensorMetadata,
    },
};
use kalypso_contract::{ContractError, DataType, Tensor};
use reqwest::StatusCode;
use std::{fmt, str::FromStr};
use tonic::transport::Channel;

/// Wire protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    /// JSON over HTTP
    Http,
    /// gRPC
    Grpc,
}

impl Protocol {
    /// 8000 for HTTP, 8001 for gRPC
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Http => 8000,
            Protocol::Grpc => 8001,
        }
    }
}

impl FromStr for Protocol {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "grpc" => Ok(Protocol::Grpc),
            _ => Err(ClientError::Protocol(s.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Grpc => f.write_str("GRPC"),
        }
    }
}

/// Client side failures
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// unknown protocol name
    #[error("unknown protocol '{0}'")]
    Protocol(String),
    /// HTTP transport
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// gRPC transport
    #[error(transparent)]
    Transport(#[from] tonic::transport::Error),
    /// gRPC status returned by the server
    #[error("{}: {}", .0.code(), .0.message())]
    Status(#[from] tonic::Status),
    /// HTTP error returned by the server
    #[error("server returned {status}: {message}")]
    Server {
        /// HTTP status
        status: u16,
        /// error message from the body
        message: String,
    },
    /// response tensor could not be decoded
    #[error(transparent)]
    Contract(#[from] ContractError),
    /// response JSON tensor could not be decoded
    #[error(transparent)]
    Json(#[from] JsonError),
}

/// Connected client
pub enum Client {
    /// HTTP client and base url
    Http {
        /// connection pool
        client: reqwest::Client,
        /// `http://host:port`
        base: String,
    },
    /// gRPC client
    Grpc {
        /// generated client
        client: GrpcInferenceServiceClient<Channel>,
        /// compress raw tensor buffers with lz4
        compress: bool,
    },
}

impl Client {
    /// Connect to `host:port`. `compress` only applies to gRPC.
    pub async fn connect(
        protocol: Protocol,
        host: &str,
        port: u16,
        compress: bool,
    ) -> Result<Self, ClientError> {
        let base = format!("http://{}:{}", host, port);
        match protocol {
            Protocol::Http => Ok(Client::Http {
                client: reqwest::Client::new(),
                base,
            }),
            Protocol::Grpc => Ok(Client::Grpc {
                client: GrpcInferenceServiceClient::connect(base).await?,
                compress,
            }),
        }
    }

    /// Server liveness
    pub async fn server_live(&mut self) -> Result<bool, ClientError> {
        match self {
            Client::Http { client, base } => {
                let response = client.get(format!("{}/v2/health/live", base)).send().await?;
                Ok(response.status() == StatusCode::OK)
            }
            Client::Grpc { client, .. } => {
                let response = client.server_live(grpc::ServerLiveRequest {}).await?;
                Ok(response.into_inner().live)
            }
        }
    }

    /// Server readiness
    pub async fn server_ready(&mut self) -> Result<bool, ClientError> {
        match self {
            Client::Http { client, base } => {
                let response = client.get(format!("{}/v2/health/ready", base)).send().await?;
                Ok(response.status() == StatusCode::OK)
            }
            Client::Grpc { client, .. } => {
                let response = client.server_ready(grpc::ServerReadyRequest {}).await?;
                Ok(response.into_inner().ready)
            }
        }
    }

    /// Readiness of any version of `model`
    pub async fn model_ready(&mut self, model: &str) -> Result<bool, ClientError> {
        match self {
            Client::Http { client, base } => {
                let url = format!("{}/v2/models/{}/ready", base, model);
                let response = client.get(url).send().await?;
                Ok(response.status() == StatusCode::OK)
            }
            Client::Grpc { client, .. } => {
                let request = grpc::ModelReadyRequest {
                    name: model.to_string(),
                    version: String::new(),
                };
                Ok(client.model_ready(request).await?.into_inner().ready)
            }
        }
    }

    /// Versions and declared tensors of `model`
    pub async fn model_metadata(&mut self, model: &str) -> Result<ModelMetadataBody, ClientError> {
        match self {
            Client::Http { client, base } => {
                let url = format!("{}/v2/models/{}", base, model);
                let response = client.get(url).send().await?;
                json_body(response).await
            }
            Client::Grpc { client, .. } => {
                let request = grpc::ModelMetadataRequest {
                    name: model.to_string(),
                    version: String::new(),
                };
                let metadata = client.model_metadata(request).await?.into_inner();
                let convert = |tensors: Vec<grpc::model_metadata_response::TensorMetadata>| {
                    tensors
                        .into_iter()
                        .map(|t| TensorMetadata {
                            name: t.name,
                            datatype: t.datatype,
                            shape: t.shape,
                        })
                        .collect()
                };
                Ok(ModelMetadataBody {
                    name: metadata.name,
                    versions: metadata.versions,
                    platform: metadata.platform,
                    inputs: convert(metadata.inputs),
                    outputs: convert(metadata.outputs),
                })
            }
        }
    }

    /// Run `model` on `inputs`, returning the requested outputs (all when
    /// `outputs` is empty) sorted by name.
    pub async fn infer(
        &mut self,
        model: &str,
        inputs: &[Tensor],
        outputs: &[&str],
    ) -> Result<Vec<Tensor>, ClientError> {
        match self {
            Client::Http { client, base } => {
                let body = InferRequestBody {
                    id: None,
                    inputs: inputs
                        .iter()
                        .map(JsonTensor::from_tensor)
                        .collect::<Result<_, _>>()?,
                    outputs: outputs
                        .iter()
                        .map(|name| RequestedOutput {
                            name: name.to_string(),
                        })
                        .collect(),
                };
                let url = format!("{}/v2/models/{}/infer", base, model);
                let response = client.post(url).json(&body).send().await?;
                let body: InferResponseBody = json_body(response).await?;
                Ok(body
                    .outputs
                    .iter()
                    .map(JsonTensor::to_tensor)
                    .collect::<Result<_, _>>()?)
            }
            Client::Grpc { client, compress } => {
                let compress = *compress;
                let request = grpc::ModelInferRequest {
                    model_name: model.to_string(),
                    model_version: String::new(),
                    id: String::new(),
                    inputs: inputs
                        .iter()
                        .map(|t| model_infer_request::InferInputTensor {
                            name: t.name().to_string(),
                            datatype: t.datatype().to_string(),
                            shape: t.shape().to_vec(),
                        })
                        .collect(),
                    outputs: outputs
                        .iter()
                        .map(|name| model_infer_request::InferRequestedOutputTensor {
                            name: name.to_string(),
                        })
                        .collect(),
                    raw_input_contents: inputs
                        .iter()
                        .map(|t| {
                            if compress {
                                lz4_flex::compress_prepend_size(t.data())
                            } else {
                                t.data().to_vec()
                            }
                        })
                        .collect(),
                    compressed: compress,
                };
                let response = client.model_infer(request).await?.into_inner();
                let compressed = response.compressed;
                response
                    .outputs
                    .into_iter()
                    .zip(response.raw_output_contents)
                    .map(|(output, raw)| {
                        let data = if compressed {
                            lz4_flex::decompress_size_prepended(&raw).map_err(|err| {
                                JsonError::Data {
                                    name: output.name.clone(),
                                    reason: format!("{:?}", err),
                                }
                            })?
                        } else {
                            raw
                        };
                        let datatype: DataType = output.datatype.parse()?;
                        Ok(Tensor::new(output.name, datatype, output.shape, data)?)
                    })
                    .collect()
            }
        }
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    Err(ClientError::Server {
        status: status.as_u16(),
        message,
    })
}
