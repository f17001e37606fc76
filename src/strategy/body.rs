use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::RequestSpec;
use crate::connection::Connection;
use crate::error::Error;
use crate::util::random_token;

const CRLF: &str = "\r\n";

/// Writes the request payload onto a connection. Called once per attempt,
/// after the configurator and the request interceptors.
pub trait BodyWriter: Send + Sync {
    fn write(&self, connection: &mut dyn Connection, request: &RequestSpec) -> crate::Result<()>;

    /// Approximate payload size, when it is known up front.
    fn estimated_len(&self) -> Option<u64> {
        None
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoBodyWriter;

impl BodyWriter for NoBodyWriter {
    fn write(&self, _connection: &mut dyn Connection, _request: &RequestSpec) -> crate::Result<()> {
        Ok(())
    }

    fn estimated_len(&self) -> Option<u64> {
        Some(0)
    }
}

#[derive(Clone, Debug)]
pub struct JsonBodyWriter {
    json: Bytes,
}

impl JsonBodyWriter {
    pub fn new(json: impl Into<String>) -> Self {
        Self {
            json: Bytes::from(json.into()),
        }
    }
}

impl BodyWriter for JsonBodyWriter {
    /// Keeps a content type set earlier by the configurator or an
    /// interceptor; otherwise uses the command's own.
    fn write(&self, connection: &mut dyn Connection, request: &RequestSpec) -> crate::Result<()> {
        if connection.request_header("Content-Type").is_none() {
            connection.set_header("Content-Type", request.content_type())?;
        }
        connection.write_body(self.json.clone())
    }

    fn estimated_len(&self) -> Option<u64> {
        Some(self.json.len() as u64)
    }
}

#[derive(Clone, Debug)]
pub struct BytesBodyWriter {
    data: Bytes,
    content_type: Option<String>,
}

impl BytesBodyWriter {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            content_type: None,
        }
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl BodyWriter for BytesBodyWriter {
    fn write(&self, connection: &mut dyn Connection, _request: &RequestSpec) -> crate::Result<()> {
        if let Some(content_type) = &self.content_type {
            connection.set_header("Content-Type", content_type)?;
        }
        connection.write_body(self.data.clone())
    }

    fn estimated_len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

#[derive(Clone, Debug)]
enum FilePayload {
    Memory(Bytes),
    Path(PathBuf),
}

/// One file part of a multipart form.
#[derive(Clone, Debug)]
pub struct MultipartFile {
    field: String,
    file_name: String,
    payload: FilePayload,
}

impl MultipartFile {
    pub fn from_bytes(
        field: impl Into<String>,
        file_name: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            field: field.into(),
            file_name: file_name.into(),
            payload: FilePayload::Memory(data.into()),
        }
    }

    /// The file is read when the body is written, once per attempt.
    pub fn from_path(field: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blob".to_owned());
        Self {
            field: field.into(),
            file_name,
            payload: FilePayload::Path(path),
        }
    }

    fn len_hint(&self) -> u64 {
        match &self.payload {
            FilePayload::Memory(data) => data.len() as u64,
            FilePayload::Path(path) => std::fs::metadata(path).map_or(0, |meta| meta.len()),
        }
    }

    fn load(&self) -> crate::Result<Bytes> {
        match &self.payload {
            FilePayload::Memory(data) => Ok(data.clone()),
            FilePayload::Path(path) => std::fs::read(path)
                .map(Bytes::from)
                .map_err(|source| Error::Body { source }),
        }
    }
}

/// Generates a multipart boundary: a fixed prefix, a random token and the
/// current time in milliseconds.
pub fn multipart_boundary() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    format!("----NetqFormBoundary{}{millis}", random_token(16))
}

/// `multipart/form-data` writer. Text fields are sent as UTF-8 plain text,
/// files as binary octet streams.
#[derive(Clone, Debug)]
pub struct MultipartBodyWriter {
    boundary: String,
    fields: Vec<(String, String)>,
    files: Vec<MultipartFile>,
}

impl MultipartBodyWriter {
    pub fn new(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            fields: Vec::new(),
            files: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, file: MultipartFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn encode(&self) -> crate::Result<Bytes> {
        let mut out = BytesMut::new();
        for (name, value) in &self.fields {
            out.put_slice(format!("--{}{CRLF}", self.boundary).as_bytes());
            out.put_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"{CRLF}").as_bytes(),
            );
            out.put_slice(format!("Content-Type: text/plain; charset=utf-8{CRLF}{CRLF}").as_bytes());
            out.put_slice(value.as_bytes());
            out.put_slice(CRLF.as_bytes());
        }
        for file in &self.files {
            let data = file.load()?;
            out.put_slice(format!("--{}{CRLF}", self.boundary).as_bytes());
            out.put_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"{CRLF}",
                    file.field, file.file_name
                )
                .as_bytes(),
            );
            out.put_slice(format!("Content-Type: application/octet-stream{CRLF}").as_bytes());
            out.put_slice(format!("Content-Transfer-Encoding: binary{CRLF}{CRLF}").as_bytes());
            out.put_slice(&data);
            out.put_slice(CRLF.as_bytes());
        }
        out.put_slice(format!("--{}--{CRLF}", self.boundary).as_bytes());
        Ok(out.freeze())
    }
}

impl BodyWriter for MultipartBodyWriter {
    fn write(&self, connection: &mut dyn Connection, _request: &RequestSpec) -> crate::Result<()> {
        let body = self.encode()?;
        connection.set_header("Content-Type", &self.content_type())?;
        connection.write_body(body)
    }

    fn estimated_len(&self) -> Option<u64> {
        let boundary_line = format!("--{}{CRLF}", self.boundary).len() as u64;
        let mut total = 0_u64;
        for (name, value) in &self.fields {
            let headers = format!(
                "Content-Disposition: form-data; name=\"{name}\"{CRLF}Content-Type: text/plain; charset=utf-8{CRLF}{CRLF}"
            );
            total += boundary_line + headers.len() as u64 + value.len() as u64 + 2;
        }
        for file in &self.files {
            let headers = format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"{CRLF}Content-Type: application/octet-stream{CRLF}Content-Transfer-Encoding: binary{CRLF}{CRLF}",
                file.field, file.file_name
            );
            total += boundary_line + headers.len() as u64 + file.len_hint() + 2;
        }
        total += format!("--{}--{CRLF}", self.boundary).len() as u64;
        Some(total)
    }
}

#[cfg(test)]
mod tests {
    use http::Method;

    use super::{BodyWriter, JsonBodyWriter, MultipartBodyWriter, MultipartFile, multipart_boundary};
    use crate::command::RequestSpec;
    use crate::connection::{ConnectionFactory, ScriptedConnectionFactory, ScriptedResponse};
    use crate::error::ErrorCode;

    #[test]
    fn multipart_body_has_fields_files_and_closing_boundary() {
        let writer = MultipartBodyWriter::new("XYZ")
            .field("title", "hello")
            .file(MultipartFile::from_bytes("doc", "a.bin", vec![1_u8, 2, 3]));
        let encoded = writer.encode().expect("encode");
        let text = String::from_utf8_lossy(&encoded);

        assert!(text.starts_with("--XYZ\r\nContent-Disposition: form-data; name=\"title\"\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n\r\nhello\r\n"));
        assert!(text.contains("name=\"doc\"; filename=\"a.bin\""));
        assert!(text.contains("Content-Transfer-Encoding: binary\r\n\r\n"));
        assert!(text.ends_with("--XYZ--\r\n"));
        assert_eq!(writer.estimated_len(), Some(encoded.len() as u64));
        assert_eq!(writer.content_type(), "multipart/form-data; boundary=XYZ");
    }

    #[test]
    fn missing_file_fails_as_body_error() {
        let writer = MultipartBodyWriter::new("B")
            .file(MultipartFile::from_path("doc", "/definitely/not/here.bin"));
        let error = writer.encode().expect_err("file is missing");
        assert_eq!(error.code(), ErrorCode::Body);
        assert!(!error.is_transient_io());
    }

    #[test]
    fn boundaries_are_unique() {
        assert_ne!(multipart_boundary(), multipart_boundary());
    }

    #[test]
    fn json_writer_sets_content_type_and_body() {
        let factory = ScriptedConnectionFactory::new().respond(ScriptedResponse::ok(""));
        let mut connection = factory.create("http://api.test/").expect("create");
        let request = RequestSpec::new(Method::POST, "/items");
        JsonBodyWriter::new(r#"{"a":1}"#)
            .write(connection.as_mut(), &request)
            .expect("write");
        connection.execute().expect("execute");

        let captured = &factory.requests()[0];
        assert_eq!(captured.body_text(), r#"{"a":1}"#);
        assert_eq!(
            captured.header("content-type"),
            Some("application/json; charset=utf-8")
        );
    }

    #[test]
    fn json_writer_keeps_an_existing_content_type() {
        let factory = ScriptedConnectionFactory::new().respond(ScriptedResponse::ok(""));
        let mut connection = factory.create("http://api.test/").expect("create");
        connection
            .set_header("content-type", "application/merge-patch+json")
            .expect("set header");
        let request = RequestSpec::new(Method::POST, "/items");
        JsonBodyWriter::new("{}")
            .write(connection.as_mut(), &request)
            .expect("write");
        connection.execute().expect("execute");

        assert_eq!(
            factory.requests()[0].header("content-type"),
            Some("application/merge-patch+json")
        );
    }
}
