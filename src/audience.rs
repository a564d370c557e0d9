use std::fmt;

/// Audience of the JWTs that IAP itself issues to the applications behind it
///
/// Applications verifying the `x-goog-iap-jwt-assertion` header compare its `aud` claim
/// against one of these, as [`verify_iap_jwt()`](crate::verify_iap_jwt) does. The URL given to
/// [`Claims`](crate::Claims) for calling through IAP is a different thing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IapAudience {
    /// An App Engine application
    AppEngine {
        /// Numeric project number
        project_number: String,
        /// Project ID, which is also the application ID
        project_id: String,
    },
    /// A backend service behind an HTTP(S) load balancer
    ComputeEngine {
        /// Numeric project number
        project_number: String,
        /// Numeric ID of the backend service
        backend_service_id: String,
    },
}

impl IapAudience {
    /// `/projects/{project_number}/apps/{project_id}`
    pub fn app_engine(project_number: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self::AppEngine {
            project_number: project_number.into(),
            project_id: project_id.into(),
        }
    }

    /// `/projects/{project_number}/global/backendServices/{backend_service_id}`
    pub fn compute_engine(
        project_number: impl Into<String>,
        backend_service_id: impl Into<String>,
    ) -> Self {
        Self::ComputeEngine {
            project_number: project_number.into(),
            backend_service_id: backend_service_id.into(),
        }
    }
}

impl fmt::Display for IapAudience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AppEngine {
                project_number,
                project_id,
            } => write!(f, "/projects/{project_number}/apps/{project_id}"),
            Self::ComputeEngine {
                project_number,
                backend_service_id,
            } => write!(
                f,
                "/projects/{project_number}/global/backendServices/{backend_service_id}"
            ),
        }
    }
}
