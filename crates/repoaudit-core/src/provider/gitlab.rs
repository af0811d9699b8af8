use once_cell::sync::Lazy;

use super::{NamespaceTable, Provider, Record};
use crate::audit::Properties;
use crate::error::{AuditError, AuditResult};

pub const GROUP_NAMESPACE: &str = "gitlab.group";
pub const MERGE_REQUEST_NAMESPACE: &str = "gitlab.merge_request";
pub const PROJECT_NAMESPACE: &str = "gitlab.project";
pub const USER_NAMESPACE: &str = "gitlab.user";

static NAMESPACES: Lazy<NamespaceTable> = Lazy::new(|| {
    NamespaceTable::new(&[
        (GROUP_NAMESPACE, &["projects", "subgroup_creation_level"]),
        (MERGE_REQUEST_NAMESPACE, &["merge_user", "merge_status", "reference"]),
        (PROJECT_NAMESPACE, &["namespace", "name_with_namespace"]),
        (USER_NAMESPACE, &["bio", "bot", "pronouns"]),
    ])
});

/// GitLab resources. No report properties or builtins are defined yet.
#[derive(Debug, Clone, Default)]
pub struct GitLab;

impl Provider for GitLab {
    fn name(&self) -> &str {
        "gitlab"
    }

    fn derive_namespace(&self, record: &Record) -> AuditResult<String> {
        NAMESPACES.detect(record)
    }

    fn derive_properties(&self, namespace: &str, _record: &Record) -> AuditResult<Properties> {
        Err(AuditError::UnknownReportProperties {
            namespace: namespace.to_string(),
        })
    }
}
