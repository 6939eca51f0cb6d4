#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use thiserror::Error;
use vix_core::types as core;
use vix_proto::v1 as wire;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConvertError {
    #[error("{field} must be non-empty")]
    EmptyField { field: &'static str },
}

fn non_empty(field: &'static str, value: &str) -> Result<(), ConvertError> {
    if value.trim().is_empty() {
        return Err(ConvertError::EmptyField { field });
    }
    Ok(())
}

pub trait ToWire<T> {
    fn to_wire(&self) -> T;
}

pub trait ToCore<T> {
    fn to_core(&self) -> T;
}

pub trait TryToCore<T> {
    type Error;
    fn try_to_core(&self) -> Result<T, Self::Error>;
}

impl ToWire<wire::KeyValuePair> for core::KeyValuePair {
    fn to_wire(&self) -> wire::KeyValuePair {
        wire::KeyValuePair {
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

impl ToCore<core::KeyValuePair> for wire::KeyValuePair {
    fn to_core(&self) -> core::KeyValuePair {
        core::KeyValuePair {
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

impl ToWire<wire::IndexState> for core::TaskState {
    fn to_wire(&self) -> wire::IndexState {
        match self {
            core::TaskState::None => wire::IndexState::None,
            core::TaskState::Unissued => wire::IndexState::Unissued,
            core::TaskState::InProgress => wire::IndexState::InProgress,
            core::TaskState::Finished => wire::IndexState::Finished,
            core::TaskState::Failed => wire::IndexState::Failed,
        }
    }
}

impl ToCore<core::TaskState> for wire::IndexState {
    fn to_core(&self) -> core::TaskState {
        match self {
            wire::IndexState::None => core::TaskState::None,
            wire::IndexState::Unissued => core::TaskState::Unissued,
            wire::IndexState::InProgress => core::TaskState::InProgress,
            wire::IndexState::Finished => core::TaskState::Finished,
            wire::IndexState::Failed => core::TaskState::Failed,
        }
    }
}

impl TryToCore<core::BuildRequest> for wire::BuildIndexRequest {
    type Error = ConvertError;

    fn try_to_core(&self) -> Result<core::BuildRequest, Self::Error> {
        non_empty("index_name", &self.index_name)?;
        if self.data_paths.is_empty() {
            return Err(ConvertError::EmptyField {
                field: "data_paths",
            });
        }
        for p in &self.data_paths {
            non_empty("data_paths", p)?;
        }

        Ok(core::BuildRequest {
            index_id: self.index_id,
            index_name: self.index_name.clone(),
            data_paths: self.data_paths.clone(),
            type_params: self.type_params.iter().map(|p| p.to_core()).collect(),
            index_params: self.index_params.iter().map(|p| p.to_core()).collect(),
        })
    }
}

impl ToWire<wire::BuildIndexRequest> for core::BuildRequest {
    fn to_wire(&self) -> wire::BuildIndexRequest {
        wire::BuildIndexRequest {
            index_id: self.index_id,
            index_name: self.index_name.clone(),
            data_paths: self.data_paths.clone(),
            type_params: self.type_params.iter().map(|p| p.to_wire()).collect(),
            index_params: self.index_params.iter().map(|p| p.to_wire()).collect(),
        }
    }
}
