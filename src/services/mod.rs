mod execution_service;

pub use execution_service::{
    ExecutionCreateRequest, ExecutionData, ExecutionEventRequest, ExecutionList,
    ExecutionListRequest, ExecutionService,
};
