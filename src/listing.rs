use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::entry::EntryId;
use crate::server::Hub;
use crate::shelf::EntrySummary;

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    pub file_list: Vec<ListedFile>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ListedFile {
    pub id: EntryId,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub url: String,
}

impl From<EntrySummary> for ListedFile {
    fn from(summary: EntrySummary) -> Self {
        Self {
            url: redirect_url(summary.id),
            id: summary.id,
            name: summary.name,
            size: summary.size,
            content_type: summary.content_type,
        }
    }
}

/// Link that resolves to an entry's download path without claiming it.
pub fn redirect_url(id: EntryId) -> String {
    format!("/hub?e={}", id)
}

/// `GET /list`
pub async fn list(State(hub): State<Hub>) -> Json<FileList> {
    let file_list: Vec<ListedFile> = hub
        .shelf()
        .snapshot()
        .into_iter()
        .map(ListedFile::from)
        .collect();
    log::debug!("list: {} pending entries", file_list.len());
    Json(FileList { file_list })
}
