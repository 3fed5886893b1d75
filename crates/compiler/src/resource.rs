use serde::{Deserialize, Serialize};

/// Kind of resource a query touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceType {
    Datasource,
    Lookup,
}

/// Action the execution of the query performs on a resource. Compiled
/// queries only ever read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Read,
}

/// One resource-permission pair for the authorization collaborator to check
/// before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAction {
    pub name: String,
    pub resource_type: ResourceType,
    pub action: Action,
}

impl ResourceAction {
    pub fn read_datasource(name: impl Into<String>) -> ResourceAction {
        ResourceAction {
            name: name.into(),
            resource_type: ResourceType::Datasource,
            action: Action::Read,
        }
    }

    pub fn read_lookup(name: impl Into<String>) -> ResourceAction {
        ResourceAction {
            name: name.into(),
            resource_type: ResourceType::Lookup,
            action: Action::Read,
        }
    }
}
