//! Protocol front ends of Kalypso. The gRPC and HTTP adapters translate
//! wire requests into dispatcher calls and share one [`dispatcher::Frontend`].

#![deny(warnings)]
#![warn(clippy::all)]

pub mod client;
pub mod grpc;
pub mod http;
pub mod json;
pub mod observability;
mod offload;

use dispatcher::Registry;
use json::{ModelMetadataBody, TensorMetadata};

/// Name reported by server metadata.
pub const SERVER_NAME: &str = "kalypso";
/// Version reported by server metadata.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Protocol extensions supported by this server.
pub const SERVER_EXTENSIONS: &[&str] = &["model_repository"];

/// Parse a version path or field, where empty means the default version.
pub fn parse_version(version: &str) -> Result<Option<u64>, dispatcher::Error> {
    if version.is_empty() {
        return Ok(None);
    }
    version
        .parse()
        .map(Some)
        .map_err(|_| dispatcher::Error::InvalidArgument(format!("invalid model version '{}'", version)))
}

/// Metadata of a model: its known versions and the contract of `version`,
/// or of the version a request without version would use.
pub fn model_metadata(
    registry: &Registry,
    name: &str,
    version: Option<u64>,
) -> Result<ModelMetadataBody, dispatcher::Error> {
    let metadata = registry.metadata(name)?;
    let contract = match version {
        Some(version) => registry.contract(name, version)?,
        None => metadata.contract,
    };
    Ok(ModelMetadataBody {
        name: metadata.name,
        versions: metadata
            .versions
            .iter()
            .map(|(version, _)| version.to_string())
            .collect(),
        platform: SERVER_NAME.to_string(),
        inputs: contract.inputs().iter().map(TensorMetadata::from).collect(),
        outputs: contract.outputs().iter().map(TensorMetadata::from).collect(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version(""), Ok(None));
        assert_eq!(parse_version("3"), Ok(Some(3)));
        assert!(parse_version("latest").is_err());
    }
}
