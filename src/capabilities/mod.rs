pub mod storage;

pub use storage::{
    Storage, StorageError, StorageKey, StorageOperation, StorageOutput, StorageResult,
};

use crux_core::render::Render;
use crux_http::Http;

use crate::app::{App, Event};

#[derive(crux_core::macros::Effect)]
#[effect(app = "App")]
pub struct Capabilities {
    pub render: Render<Event>,
    pub http: Http<Event>,
    pub storage: Storage<Event>,
}
