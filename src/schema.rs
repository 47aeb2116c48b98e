use serde::Deserialize;

// ------------------------------------------------------------
// Registration response
// ------------------------------------------------------------
//
// The register endpoint answers with
//
//     {"data":{"regid":"12345"}}
//
// Any other shape (missing `data`, non-string `regid`) is a
// failed registration.
//
#[derive(Debug, Deserialize)]
pub struct RegisterResponse {
    pub data: RegisterData,
}

#[derive(Debug, Deserialize)]
pub struct RegisterData {
    /// Server-assigned registration id
    pub regid: Option<String>,
}

impl RegisterResponse {
    /// Decodes a response body and returns the regid, `""` when the
    /// server sent none.
    pub fn regid_from(body: &[u8]) -> Result<String, serde_json::Error> {
        let response: RegisterResponse = serde_json::from_slice(body)?;
        Ok(response.data.regid.unwrap_or_default())
    }
}
