//! Just enough of the PostgreSQL v3 wire protocol to open a replication
//! session and drive a BASE_BACKUP command: startup and password
//! authentication, the simple query flow, and COPY-out streaming. Each
//! message is a type byte followed by a big-endian length that includes
//! itself.

use std::io::{Read, Write};
use std::net::TcpStream;

use log::{debug, warn};

use crate::error::{BackupError, Result};
use crate::transport::{BulkFrame, Row, Transport};

/// Protocol 3.0.
const PROTOCOL_VERSION: u32 = 196608;

pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
}

pub struct PgConnection {
    stream: TcpStream,
}

impl PgConnection {
    /// Open a replication-mode session and authenticate. The server decides
    /// whether a password is needed; cleartext and MD5 requests are honored.
    pub fn connect(params: &ConnectParams) -> Result<Self> {
        let stream = TcpStream::connect((params.host.as_str(), params.port)).map_err(|e| {
            BackupError::Connection(format!(
                "could not connect to {}:{}: {e}",
                params.host, params.port
            ))
        })?;
        stream.set_nodelay(true).ok();
        let mut conn = Self { stream };
        conn.send_startup(&params.user)?;
        conn.authenticate(params)?;
        debug!("replication session to {}:{} open", params.host, params.port);
        Ok(conn)
    }

    fn send_startup(&mut self, user: &str) -> Result<()> {
        let mut body = Vec::new();
        body.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        for (key, value) in [
            ("user", user),
            ("database", "replication"),
            ("replication", "true"),
            ("application_name", "pgback"),
        ] {
            body.extend_from_slice(key.as_bytes());
            body.push(0);
            body.extend_from_slice(value.as_bytes());
            body.push(0);
        }
        body.push(0);

        let len = (body.len() + 4) as u32;
        let mut packet = len.to_be_bytes().to_vec();
        packet.extend_from_slice(&body);
        self.stream.write_all(&packet).map_err(sock_err)
    }

    fn authenticate(&mut self, params: &ConnectParams) -> Result<()> {
        loop {
            let (kind, payload) = self.read_message()?;
            match kind {
                b'R' => {
                    if payload.len() < 4 {
                        return Err(BackupError::Connection(
                            "short authentication message".into(),
                        ));
                    }
                    let code = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                    match code {
                        0 => {} // AuthenticationOk
                        3 => {
                            let password = required_password(params)?;
                            self.send_password(password)?;
                        }
                        5 => {
                            if payload.len() < 8 {
                                return Err(BackupError::Connection(
                                    "short MD5 authentication message".into(),
                                ));
                            }
                            let password = required_password(params)?;
                            let hashed = md5_password(&params.user, password, &payload[4..8]);
                            self.send_password(&hashed)?;
                        }
                        other => {
                            return Err(BackupError::Connection(format!(
                                "unsupported authentication request: {other}"
                            )))
                        }
                    }
                }
                b'S' | b'K' => {} // ParameterStatus / BackendKeyData
                b'N' => notice(&payload),
                b'Z' => return Ok(()), // ReadyForQuery
                b'E' => return Err(BackupError::Server(parse_error_message(&payload))),
                other => debug!("ignoring message {:?} during startup", other as char),
            }
        }
    }

    fn send_password(&mut self, password: &str) -> Result<()> {
        let mut body = password.as_bytes().to_vec();
        body.push(0);
        self.write_message(b'p', &body)
    }

    fn write_message(&mut self, kind: u8, body: &[u8]) -> Result<()> {
        let mut packet = vec![kind];
        packet.extend_from_slice(&((body.len() + 4) as u32).to_be_bytes());
        packet.extend_from_slice(body);
        self.stream.write_all(&packet).map_err(sock_err)
    }

    fn read_message(&mut self) -> Result<(u8, Vec<u8>)> {
        let mut kind = [0u8; 1];
        self.stream.read_exact(&mut kind).map_err(sock_err)?;
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len).map_err(sock_err)?;
        let len = u32::from_be_bytes(len) as usize;
        if len < 4 {
            return Err(BackupError::Connection(format!(
                "invalid message length {len}"
            )));
        }
        let mut payload = vec![0u8; len - 4];
        self.stream.read_exact(&mut payload).map_err(sock_err)?;
        Ok((kind[0], payload))
    }
}

impl Transport for PgConnection {
    fn send_command(&mut self, command: &str) -> Result<()> {
        debug!("sending command: {command}");
        let mut body = command.as_bytes().to_vec();
        body.push(0);
        self.write_message(b'Q', &body)
    }

    fn read_result_rows(&mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        loop {
            let (kind, payload) = self.read_message()?;
            match kind {
                b'T' => {} // RowDescription; DataRow is self-describing
                b'D' => rows.push(parse_data_row(&payload)?),
                // CopyOutResponse: the first area's stream begins here
                b'H' => return Ok(rows),
                b'C' | b'Z' => return Ok(rows),
                b'N' => notice(&payload),
                b'E' => return Err(BackupError::Server(parse_error_message(&payload))),
                other => debug!("ignoring message {:?} while reading rows", other as char),
            }
        }
    }

    fn read_bulk_frame(&mut self) -> Result<BulkFrame> {
        loop {
            let (kind, payload) = self.read_message()?;
            match kind {
                b'd' => return Ok(BulkFrame::Data(payload)),
                b'c' => return Ok(BulkFrame::EndOfStream),
                // CopyOutResponse opening the next area's stream
                b'H' => {}
                b'N' => notice(&payload),
                b'E' => return Err(BackupError::Server(parse_error_message(&payload))),
                b'C' | b'Z' => {
                    return Err(BackupError::Server(
                        "server ended the backup stream early".into(),
                    ))
                }
                other => debug!("ignoring message {:?} in COPY stream", other as char),
            }
        }
    }

    fn read_completion_status(&mut self) -> Result<()> {
        loop {
            let (kind, payload) = self.read_message()?;
            match kind {
                b'C' => {
                    debug!("command complete");
                    return Ok(());
                }
                b'N' => notice(&payload),
                b'E' => return Err(BackupError::Server(parse_error_message(&payload))),
                b'Z' => {
                    return Err(BackupError::Server(
                        "backup ended without a completion acknowledgment".into(),
                    ))
                }
                other => debug!("ignoring message {:?} at completion", other as char),
            }
        }
    }
}

fn sock_err(err: std::io::Error) -> BackupError {
    BackupError::Connection(err.to_string())
}

fn required_password(params: &ConnectParams) -> Result<&str> {
    params.password.as_deref().ok_or_else(|| {
        BackupError::Connection(
            "server requested a password but none was provided (set PGPASSWORD)".into(),
        )
    })
}

/// The double-hash scheme the server expects for MD5 authentication:
/// `"md5" + md5(md5(password + user) + salt)`, hashes spelled in lowercase
/// hex.
fn md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut salted = inner.into_bytes();
    salted.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(salted))
}

/// DataRow: a big-endian column count, then per column a signed length (-1
/// for NULL) and that many bytes.
fn parse_data_row(payload: &[u8]) -> Result<Row> {
    let short = || BackupError::Connection("short DataRow message".into());
    if payload.len() < 2 {
        return Err(short());
    }
    let ncols = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let mut row = Vec::with_capacity(ncols);
    let mut pos = 2;
    for _ in 0..ncols {
        let end = pos + 4;
        let len_bytes = payload.get(pos..end).ok_or_else(short)?;
        let len = i32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        pos = end;
        if len < 0 {
            row.push(None);
            continue;
        }
        let bytes = payload.get(pos..pos + len as usize).ok_or_else(short)?;
        row.push(Some(String::from_utf8_lossy(bytes).into_owned()));
        pos += len as usize;
    }
    Ok(row)
}

/// ErrorResponse and NoticeResponse carry tagged NUL-terminated fields; 'M'
/// is the human-readable message.
fn parse_error_message(payload: &[u8]) -> String {
    let mut pos = 0;
    let mut message = None;
    while pos < payload.len() && payload[pos] != 0 {
        let tag = payload[pos];
        pos += 1;
        let end = payload[pos..]
            .iter()
            .position(|b| *b == 0)
            .map(|i| pos + i)
            .unwrap_or(payload.len());
        if tag == b'M' {
            message = Some(String::from_utf8_lossy(&payload[pos..end]).into_owned());
        }
        pos = end + 1;
    }
    message.unwrap_or_else(|| "unknown server error".into())
}

fn notice(payload: &[u8]) {
    warn!("server notice: {}", parse_error_message(payload));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_data_rows_with_nulls() -> anyhow::Result<()> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&3u16.to_be_bytes());
        payload.extend_from_slice(&5i32.to_be_bytes());
        payload.extend_from_slice(b"16384");
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&0i32.to_be_bytes());

        let row = parse_data_row(&payload)?;
        assert_eq!(
            row,
            vec![Some("16384".to_string()), None, Some(String::new())]
        );
        Ok(())
    }

    #[test]
    fn rejects_truncated_data_rows() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&100i32.to_be_bytes());
        payload.extend_from_slice(b"too short");
        assert!(parse_data_row(&payload).is_err());
    }

    #[test]
    fn extracts_the_message_field_from_error_responses() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"SFATAL\0");
        payload.extend_from_slice(b"Mrole \"nobody\" does not exist\0");
        payload.push(0);
        assert_eq!(
            parse_error_message(&payload),
            "role \"nobody\" does not exist"
        );
        assert_eq!(parse_error_message(&[0]), "unknown server error");
    }

    #[test]
    fn md5_password_has_the_expected_shape() {
        let one = md5_password("postgres", "secret", &[1, 2, 3, 4]);
        let two = md5_password("postgres", "secret", &[9, 9, 9, 9]);
        assert!(one.starts_with("md5"));
        assert_eq!(one.len(), 35);
        assert!(one[3..].bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(one, two);
        assert_eq!(one, md5_password("postgres", "secret", &[1, 2, 3, 4]));
    }
}
