use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http::{Method, StatusCode};

use crate::PipexResult;
use crate::context::Context;
use crate::error::Error;
use crate::policy::{Policy, send_next};
use crate::request::{Request, ResponseMode};
use crate::response::{Response, ResponseBody};

/// Buffers and content-decodes the response body for buffered-mode calls.
/// Streamed-mode responses pass through untouched, still encoded.
#[derive(Debug, Default)]
pub struct ContentDecodePolicy;

#[async_trait]
impl Policy for ContentDecodePolicy {
    async fn send(
        &self,
        context: &Context,
        request: &mut Request,
        next: &[Arc<dyn Policy>],
    ) -> PipexResult<Response> {
        let response_mode = request.options().response_mode;
        let method = request.method().clone();
        let mut response = send_next(context, request, next).await?;
        if response_mode == ResponseMode::Streamed {
            return Ok(response);
        }

        let body = response.collect().await?;
        if should_decode(&method, response.status(), body.len()) {
            let decoded = decode_content_encoded_body(body, response.headers())?;
            if response.headers().contains_key(CONTENT_ENCODING) {
                response.headers_mut().remove(CONTENT_ENCODING);
                response.headers_mut().remove(CONTENT_LENGTH);
            }
            response.set_body(ResponseBody::Buffered(decoded));
        }
        Ok(response)
    }
}

fn should_decode(method: &Method, status: StatusCode, body_len: usize) -> bool {
    if body_len == 0 {
        return false;
    }
    if *method == Method::HEAD {
        return false;
    }
    if status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    true
}

fn read_to_end(reader: &mut impl Read, encoding: &str) -> Result<Vec<u8>, Error> {
    let mut decoded = Vec::new();
    reader
        .read_to_end(&mut decoded)
        .map_err(|error| Error::DecodeContentEncoding {
            encoding: encoding.to_owned(),
            message: error.to_string(),
        })?;
    Ok(decoded)
}

fn decode_content_encoded_body(
    mut body: Bytes,
    headers: &http::HeaderMap,
) -> Result<Bytes, Error> {
    let Some(content_encoding) = headers.get(CONTENT_ENCODING) else {
        return Ok(body);
    };
    let content_encoding =
        content_encoding
            .to_str()
            .map_err(|error| Error::DecodeContentEncoding {
                encoding: "content-encoding".to_owned(),
                message: error.to_string(),
            })?;
    let mut encodings = content_encoding
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect::<Vec<_>>();

    while let Some(encoding) = encodings.pop() {
        let decoded = match encoding.to_ascii_lowercase().as_str() {
            "identity" => body.to_vec(),
            "gzip" => {
                let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
                read_to_end(&mut decoder, encoding)?
            }
            "deflate" => {
                let mut decoder = flate2::read::ZlibDecoder::new(body.as_ref());
                read_to_end(&mut decoder, encoding)?
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
