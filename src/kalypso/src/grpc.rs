//! gRPC adapter. Tensor data travels in raw little-endian buffers,
//! optionally lz4 compressed with the size prepended.

tonic::include_proto!("kalypso");

use crate::{
    json::TensorMetadata, model_metadata, offload, parse_version, SERVER_EXTENSIONS, SERVER_NAME,
    SERVER_VERSION,
};
use dispatcher::{Error, Frontend, InferenceRequest, InferenceResponse};
use grpc_inference_service_server::{GrpcInferenceService, GrpcInferenceServiceServer};
use kalypso_contract::{utils, DataType, Tensor};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{transport::Server, Request, Response, Status};

/// Largest decompressed input buffer accepted by default, 64 MiB.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 64 << 20;

/// Kalypso's gRPC service
pub struct Service {
    frontend: Frontend,
    max_input_bytes: usize,
}

impl Service {
    /// Create a Service
    pub fn new(frontend: Frontend) -> Self {
        Service {
            frontend,
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }

    /// Cap on the decompressed size of one compressed input.
    pub fn max_input_bytes(mut self, max_input_bytes: usize) -> Self {
        self.max_input_bytes = max_input_bytes;
        self
    }
}

/// Serve on an already bound listener until the transport fails.
pub async fn serve(listener: TcpListener, service: Service) -> Result<(), tonic::transport::Error> {
    if let Ok(addr) = listener.local_addr() {
        log::info!("gRPC service listening on {}", addr);
    }
    Server::builder()
        .add_service(GrpcInferenceServiceServer::new(service))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await
}

/// Map a dispatch error to its gRPC status.
pub fn to_status(err: Error) -> Status {
    let message = err.to_string();
    match err {
        Error::InvalidArgument(_) => Status::invalid_argument(message),
        Error::NotFound(_) | Error::VersionNotFound { .. } => Status::not_found(message),
        Error::NotReady { .. } | Error::Unavailable(_) => Status::unavailable(message),
        Error::Cancelled => Status::cancelled(message),
        Error::AlreadyExists { .. } => Status::already_exists(message),
        Error::Internal(_) => Status::internal(message),
    }
}

impl From<TensorMetadata> for model_metadata_response::TensorMetadata {
    fn from(t: TensorMetadata) -> Self {
        model_metadata_response::TensorMetadata {
            name: t.name,
            datatype: t.datatype,
            shape: t.shape,
        }
    }
}

fn decode_request(
    request: ModelInferRequest,
    max_input_bytes: usize,
) -> Result<InferenceRequest, Error> {
    let ModelInferRequest {
        model_name,
        model_version,
        id,
        inputs,
        outputs,
        raw_input_contents,
        compressed,
    } = request;
    if inputs.len() != raw_input_contents.len() {
        return Err(Error::InvalidArgument(format!(
            "{} inputs but {} raw input contents",
            inputs.len(),
            raw_input_contents.len()
        )));
    }
    let tensors = inputs
        .into_iter()
        .zip(raw_input_contents)
        .map(|(input, raw)| {
            let datatype: DataType = input.datatype.parse()?;
            let data = if compressed {
                decompress(&input, datatype, &raw, max_input_bytes)?
            } else {
                raw
            };
            Ok(Tensor::new(input.name, datatype, input.shape, data)?)
        })
        .collect::<Result<Vec<_>, Error>>()?;
    let mut request = InferenceRequest::new(model_name).id(id).with_inputs(tensors)?;
    if let Some(version) = parse_version(&model_version)? {
        request = request.version(version);
    }
    for output in outputs {
        request = request.request_output(output.name);
    }
    Ok(request)
}

/// The size prefix is checked against `max_input_bytes`, and for fixed size
/// types against the declared shape, before anything is allocated.
fn decompress(
    input: &model_infer_request::InferInputTensor,
    datatype: DataType,
    raw: &[u8],
    max_input_bytes: usize,
) -> Result<Vec<u8>, Error> {
    let invalid = |reason: String| Error::InvalidArgument(format!("input '{}': {}", input.name, reason));
    if raw.len() < 4 {
        return Err(invalid("compressed buffer too short".to_string()));
    }
    let prefix = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    if prefix > max_input_bytes {
        return Err(invalid(format!(
            "decompressed size {} exceeds the limit of {} bytes",
            prefix, max_input_bytes
        )));
    }
    let expected = datatype.element_size().and_then(|size| {
        utils::element_count(&input.shape).and_then(|count| count.checked_mul(size))
    });
    if let Some(expected) = expected {
        if prefix != expected {
            return Err(invalid(format!(
                "decompressed size {} does not match shape {:?}",
                prefix, input.shape
            )));
        }
    }
    lz4_flex::decompress_size_prepended(raw).map_err(|err| invalid(format!("{:?}", err)))
}

fn encode_response(response: InferenceResponse, compressed: bool) -> ModelInferResponse {
    let InferenceResponse {
        id,
        model_name,
        model_version,
        outputs,
    } = response;
    let mut outputs: Vec<Tensor> = outputs.into_iter().map(|(_, tensor)| tensor).collect();
    outputs.sort_by(|a, b| a.name().cmp(b.name()));
    let metadata = outputs
        .iter()
        .map(|t| model_infer_response::InferOutputTensor {
            name: t.name().to_string(),
            datatype: t.datatype().to_string(),
            shape: t.shape().to_vec(),
        })
        .collect();
    let raw_output_contents = outputs
        .into_iter()
        .map(|t| {
            if compressed {
                lz4_flex::compress_prepend_size(t.data())
            } else {
                t.into_data()
            }
        })
        .collect();
    ModelInferResponse {
        model_name,
        model_version: model_version.to_string(),
        id,
        outputs: metadata,
        raw_output_contents,
        compressed,
    }
}

#[tonic::async_trait]
impl GrpcInferenceService for Service {
    async fn server_live(
        &self,
        _request: Request<ServerLiveRequest>,
    ) -> Result<Response<ServerLiveResponse>, Status> {
        Ok(Response::new(ServerLiveResponse {
            live: self.frontend.health.live(),
        }))
    }

    async fn server_ready(
        &self,
        _request: Request<ServerReadyRequest>,
    ) -> Result<Response<ServerReadyResponse>, Status> {
        Ok(Response::new(ServerReadyResponse {
            ready: self.frontend.health.ready(),
        }))
    }

    async fn model_ready(
        &self,
        request: Request<ModelReadyRequest>,
    ) -> Result<Response<ModelReadyResponse>, Status> {
        let request = request.into_inner();
        let health = &self.frontend.health;
        let ready = match parse_version(&request.version).map_err(to_status)? {
            Some(version) => health.model_version_ready(&request.name, version),
            None => health.model_ready(&request.name),
        };
        Ok(Response::new(ModelReadyResponse { ready }))
    }

    async fn server_metadata(
        &self,
        _request: Request<ServerMetadataRequest>,
    ) -> Result<Response<ServerMetadataResponse>, Status> {
        Ok(Response::new(ServerMetadataResponse {
            name: SERVER_NAME.to_string(),
            version: SERVER_VERSION.to_string(),
            extensions: SERVER_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
        }))
    }

    async fn model_metadata(
        &self,
        request: Request<ModelMetadataRequest>,
    ) -> Result<Response<ModelMetadataResponse>, Status> {
        let request = request.into_inner();
        let version = parse_version(&request.version).map_err(to_status)?;
        let metadata =
            model_metadata(&self.frontend.registry, &request.name, version).map_err(to_status)?;
        Ok(Response::new(ModelMetadataResponse {
            name: metadata.name,
            versions: metadata.versions,
            platform: metadata.platform,
            inputs: metadata.inputs.into_iter().map(Into::into).collect(),
            outputs: metadata.outputs.into_iter().map(Into::into).collect(),
        }))
    }

    async fn model_infer(
        &self,
        request: Request<ModelInferRequest>,
    ) -> Result<Response<ModelInferResponse>, Status> {
        let request = request.into_inner();
        let compressed = request.compressed;
        let request = decode_request(request, self.max_input_bytes).map_err(to_status)?;
        let response = offload::dispatch(self.frontend.dispatcher.clone(), request)
            .await
            .map_err(to_status)?;
        Ok(Response::new(encode_response(response, compressed)))
    }
}
