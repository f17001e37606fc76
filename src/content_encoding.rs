use std::io::Read;

use bytes::Bytes;

use crate::error::Error;

fn read_to_end_limited<R: Read>(
    reader: &mut R,
    encoding: &str,
    max_bytes: usize,
) -> Result<Vec<u8>, Error> {
    let mut decoded = Vec::new();
    let mut chunk = [0_u8; 8 * 1024];

    loop {
        let read = reader
            .read(&mut chunk)
            .map_err(|error| Error::DecodeContentEncoding {
                encoding: encoding.to_owned(),
                message: error.to_string(),
            })?;
        if read == 0 {
            break;
        }
        let next_size = decoded.len().saturating_add(read);
        if next_size > max_bytes {
            return Err(Error::ResponseBodyTooLarge {
                limit_bytes: max_bytes,
                actual_bytes: next_size,
            });
        }
        decoded.extend_from_slice(&chunk[..read]);
    }

    Ok(decoded)
}

/// Undoes the codings listed in a `Content-Encoding` value, last applied
/// first. `None` or an empty value leaves the body untouched.
pub(crate) fn decode_content_encoded_body_limited(
    mut body: Bytes,
    content_encoding: Option<&str>,
    max_bytes: usize,
) -> Result<Bytes, Error> {
    let max_bytes = max_bytes.max(1);
    let Some(content_encoding) = content_encoding else {
        return Ok(body);
    };
    if body.is_empty() {
        return Ok(body);
    }

    let mut encodings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();

    while let Some(encoding) = encodings.pop() {
        let decoded = match encoding.to_ascii_lowercase().as_str() {
            "identity" => {
                if body.len() > max_bytes {
                    return Err(Error::ResponseBodyTooLarge {
                        limit_bytes: max_bytes,
                        actual_bytes: body.len(),
                    });
                }
                body.to_vec()
            }
            "gzip" | "x-gzip" => {
                let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            "deflate" => {
                let mut decoder = flate2::read::ZlibDecoder::new(body.as_ref());
                read_to_end_limited(&mut decoder, encoding, max_bytes)?
            }
            other => {
                return Err(Error::DecodeContentEncoding {
                    encoding: other.to_owned(),
                    message: "unsupported content-encoding".to_owned(),
                });
            }
        };
        body = Bytes::from(decoded);
    }

    Ok(body)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::decode_content_encoded_body_limited;
    use crate::error::ErrorCode;

    fn gzip(data: &[u8]) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).expect("write gzip payload");
        Bytes::from(encoder.finish().expect("finish gzip payload"))
    }

    #[test]
    fn decodes_gzip_body() {
        let decoded =
            decode_content_encoded_body_limited(gzip(br#"{"ok":true}"#), Some("gzip"), 1024)
                .expect("decode gzip");
        assert_eq!(decoded.as_ref(), br#"{"ok":true}"#);
    }

    #[test]
    fn decoded_size_is_limited() {
        let error = decode_content_encoded_body_limited(gzip(&[b'a'; 4096]), Some("gzip"), 128)
            .expect_err("limit exceeded");
        assert_eq!(error.code(), ErrorCode::ResponseBodyTooLarge);
    }

    #[test]
    fn unsupported_encoding_is_rejected() {
        let error =
            decode_content_encoded_body_limited(Bytes::from_static(b"xx"), Some("br"), 1024)
                .expect_err("br is not supported");
        assert_eq!(error.code(), ErrorCode::DecodeContentEncoding);
    }
}
