//! Desktop Link Protocol
//!
//! The RPC layer Palm applications speak. A request is one message through
//! the framed duplex; the response comes back on the next message with the
//! command id's high bit set:
//!
//! ```text
//! request:  [CMD] [ARGC] [ARGS...]
//! response: [CMD|0x80] [ARGC] [ERRNO (u16 BE)] [ARGS...]
//! ```
//!
//! Requests are strictly sequential: the next request is not serialized
//! until the previous response has been fully received.

pub mod args;
pub mod requests;
pub mod schema;

pub use requests::{DbInfo, RecordInfo, SysInfo, UserInfo};
pub use schema::{CommandDesc, DlpDateTime, Value};

use crate::error::{Error, Result};
use crate::protocol::MessageLink;
use args::{ARG_ID_BASE, ArgReader};
use schema::{decode_arg_payload, encode_arg_payload};

pub const RESPONSE_BIT: u8 = 0x80;

// Status codes from the HotSync error table
pub const STATUS_OK: u16 = 0x00;
pub const STATUS_SYSTEM: u16 = 0x01;
pub const STATUS_ILLEGAL_REQUEST: u16 = 0x02;
pub const STATUS_OUT_OF_MEMORY: u16 = 0x03;
pub const STATUS_INVALID_PARAMETER: u16 = 0x04;
pub const STATUS_NOT_FOUND: u16 = 0x05;
pub const STATUS_NONE_OPEN: u16 = 0x06;
pub const STATUS_ALREADY_OPEN: u16 = 0x07;
pub const STATUS_TOO_MANY_OPEN: u16 = 0x08;
pub const STATUS_ALREADY_EXISTS: u16 = 0x09;
pub const STATUS_CANNOT_OPEN: u16 = 0x0A;
pub const STATUS_RECORD_DELETED: u16 = 0x0B;
pub const STATUS_RECORD_BUSY: u16 = 0x0C;
pub const STATUS_NOT_SUPPORTED: u16 = 0x0D;
pub const STATUS_READ_ONLY: u16 = 0x0F;
pub const STATUS_NOT_ENOUGH_SPACE: u16 = 0x10;
pub const STATUS_LIMIT_EXCEEDED: u16 = 0x11;
pub const STATUS_SYNC_CANCELLED: u16 = 0x12;

/// Human-readable name for a DLP status code
pub fn status_name(code: u16) -> &'static str {
    match code {
        STATUS_OK => "ok",
        STATUS_SYSTEM => "system error",
        STATUS_ILLEGAL_REQUEST => "illegal request",
        STATUS_OUT_OF_MEMORY => "out of memory",
        STATUS_INVALID_PARAMETER => "invalid parameter",
        STATUS_NOT_FOUND => "not found",
        STATUS_NONE_OPEN => "no database open",
        STATUS_ALREADY_OPEN => "database already open",
        STATUS_TOO_MANY_OPEN => "too many open databases",
        STATUS_ALREADY_EXISTS => "already exists",
        STATUS_CANNOT_OPEN => "cannot open",
        STATUS_RECORD_DELETED => "record deleted",
        STATUS_RECORD_BUSY => "record busy",
        STATUS_NOT_SUPPORTED => "not supported",
        STATUS_READ_ONLY => "read only",
        STATUS_NOT_ENOUGH_SPACE => "not enough space",
        STATUS_LIMIT_EXCEEDED => "limit exceeded",
        STATUS_SYNC_CANCELLED => "sync cancelled",
        _ => "unknown",
    }
}

/// A DLP conversation over a framed duplex
pub struct DlpConnection {
    link: Box<dyn MessageLink>,
}

impl DlpConnection {
    pub fn new(link: Box<dyn MessageLink>) -> Self {
        DlpConnection { link }
    }

    pub fn into_link(self) -> Box<dyn MessageLink> {
        self.link
    }

    /// Execute one request and decode its paired response
    pub fn execute(&mut self, desc: &CommandDesc, args: &[&[Value]]) -> Result<Vec<Vec<Value>>> {
        if args.len() != desc.request.len() {
            return Err(Error::Protocol(format!(
                "{} takes {} arguments, got {}",
                desc.name,
                desc.request.len(),
                args.len()
            )));
        }

        let mut message = vec![desc.command, desc.request.len() as u8];
        for (i, (arg_desc, values)) in desc.request.iter().zip(args).enumerate() {
            let payload = encode_arg_payload(arg_desc, values)?;
            args::encode_arg(&mut message, i, &payload);
        }

        log::debug!("DLP -> {} (0x{:02X})", desc.name, desc.command);
        self.link.send_message(&message)?;
        let reply = self.link.recv_message()?;

        self.decode_response(desc, &reply)
    }

    fn decode_response(&self, desc: &CommandDesc, reply: &[u8]) -> Result<Vec<Vec<Value>>> {
        if reply.len() < 4 {
            return Err(Error::Protocol(format!(
                "short DLP response ({} bytes)",
                reply.len()
            )));
        }
        if reply[0] != desc.command | RESPONSE_BIT {
            return Err(Error::Protocol(format!(
                "command mismatch: sent {} (0x{:02X}), response for 0x{:02X}",
                desc.name,
                desc.command,
                reply[0] & !RESPONSE_BIT
            )));
        }

        let argc = reply[1] as usize;
        let errno = u16::from_be_bytes([reply[2], reply[3]]);
        if errno != STATUS_OK {
            log::debug!(
                "DLP <- {} failed: 0x{:04X} ({})",
                desc.name,
                errno,
                status_name(errno)
            );
            return Err(Error::Dlp(errno));
        }
        if argc != desc.response.len() {
            return Err(Error::Protocol(format!(
                "{} response argument count mismatch: schema {}, wire {}",
                desc.name,
                desc.response.len(),
                argc
            )));
        }

        let mut reader = ArgReader::new(&reply[4..]);
        let mut decoded = Vec::with_capacity(argc);
        for (i, arg_desc) in desc.response.iter().enumerate() {
            let (id, payload) = reader.read_arg()?;
            let expected = ARG_ID_BASE + i as u8;
            if id != expected {
                return Err(Error::Protocol(format!(
                    "{} argument id 0x{:02X}, expected 0x{:02X}",
                    desc.name, id, expected
                )));
            }
            decoded.push(decode_arg_payload(arg_desc, payload)?);
        }
        Ok(decoded)
    }

    // ========================================================================
    // Typed convenience calls
    // ========================================================================

    pub fn read_sys_info(&mut self) -> Result<SysInfo> {
        let decoded = self.execute(&requests::READ_SYS_INFO, &[])?;
        SysInfo::from_args(&decoded)
    }

    pub fn read_user_info(&mut self) -> Result<UserInfo> {
        let decoded = self.execute(&requests::READ_USER_INFO, &[])?;
        UserInfo::from_args(&decoded)
    }

    /// Update the device's sync identity after a successful pass
    pub fn write_user_info(
        &mut self,
        user: &UserInfo,
        sync_pc: u32,
        sync_date: DlpDateTime,
    ) -> Result<()> {
        let mut username = user.username.as_bytes().to_vec();
        username.push(0);
        let username_len = username.len() as u8;

        self.execute(
            &requests::WRITE_USER_INFO,
            &[&[
                Value::U32(user.user_id),
                Value::U32(user.viewer_id),
                Value::U32(sync_pc),
                Value::DateTime(sync_date),
                Value::U8(requests::MOD_SYNC_PC | requests::MOD_SYNC_DATE),
                Value::U8(username_len),
                Value::Bytes(username),
            ]],
        )?;
        Ok(())
    }

    /// Read the complete database directory from RAM
    pub fn read_db_list(&mut self) -> Result<Vec<DbInfo>> {
        let mut databases = Vec::new();
        let mut start_index: u16 = 0;

        loop {
            let result = self.execute(
                &requests::READ_DB_LIST,
                &[&[
                    Value::U8(requests::DB_LIST_RAM),
                    Value::U8(0),
                    Value::U16(start_index),
                ]],
            );
            let decoded = match result {
                Ok(decoded) => decoded,
                Err(Error::Dlp(STATUS_NOT_FOUND)) => break,
                Err(e) => return Err(e),
            };

            let last_index = decoded[0][0].as_u16()?;
            let entries = decoded[0][2].as_list()?;
            if entries.is_empty() {
                break;
            }
            for entry in entries {
                databases.push(DbInfo::from_values(entry)?);
            }
            start_index = last_index.wrapping_add(1);
            if start_index == 0 {
                break;
            }
        }
        Ok(databases)
    }

    pub fn open_db(&mut self, card_no: u8, mode: u8, name: &str) -> Result<u8> {
        let decoded = self.execute(
            &requests::OPEN_DB,
            &[&[
                Value::U8(card_no),
                Value::U8(mode),
                Value::Str(name.to_string()),
            ]],
        )?;
        decoded[0][0].as_u8()
    }

    pub fn create_db(
        &mut self,
        creator: [u8; 4],
        type_code: [u8; 4],
        db_flags: u16,
        version: u16,
        name: &str,
    ) -> Result<u8> {
        let decoded = self.execute(
            &requests::CREATE_DB,
            &[&[
                Value::Bytes(creator.to_vec()),
                Value::Bytes(type_code.to_vec()),
                Value::U8(0),
                Value::U8(0),
                Value::U16(db_flags),
                Value::U16(version),
                Value::Str(name.to_string()),
            ]],
        )?;
        decoded[0][0].as_u8()
    }

    pub fn close_db(&mut self, db_handle: u8) -> Result<()> {
        self.execute(&requests::CLOSE_DB, &[&[Value::U8(db_handle)]])?;
        Ok(())
    }

    pub fn delete_db(&mut self, card_no: u8, name: &str) -> Result<()> {
        self.execute(
            &requests::DELETE_DB,
            &[&[Value::U8(card_no), Value::U8(0), Value::Str(name.to_string())]],
        )?;
        Ok(())
    }

    pub fn read_open_db_info(&mut self, db_handle: u8) -> Result<u16> {
        let decoded = self.execute(&requests::READ_OPEN_DB_INFO, &[&[Value::U8(db_handle)]])?;
        decoded[0][0].as_u16()
    }

    pub fn read_record_by_index(&mut self, db_handle: u8, index: u16) -> Result<RecordInfo> {
        let decoded = self.execute(
            &requests::READ_RECORD_BY_INDEX,
            &[&[
                Value::U8(db_handle),
                Value::U8(0),
                Value::U16(index),
                Value::U16(0),
                Value::U16(0xFFFF),
            ]],
        )?;
        RecordInfo::from_args(&decoded)
    }

    /// Next record with the dirty attribute, or `Dlp(not found)` when done
    pub fn read_next_modified_rec(&mut self, db_handle: u8) -> Result<RecordInfo> {
        let decoded =
            self.execute(&requests::READ_NEXT_MODIFIED_REC, &[&[Value::U8(db_handle)]])?;
        RecordInfo::from_args(&decoded)
    }

    pub fn write_record(
        &mut self,
        db_handle: u8,
        record_id: u32,
        attributes: u8,
        category: u8,
        data: &[u8],
    ) -> Result<u32> {
        let decoded = self.execute(
            &requests::WRITE_RECORD,
            &[&[
                Value::U8(db_handle),
                Value::U8(0x80),
                Value::U32(record_id),
                Value::U8(attributes),
                Value::U8(category),
                Value::Bytes(data.to_vec()),
            ]],
        )?;
        decoded[0][0].as_u32()
    }

    pub fn delete_record(&mut self, db_handle: u8, record_id: u32) -> Result<()> {
        self.execute(
            &requests::DELETE_RECORD,
            &[&[Value::U8(db_handle), Value::U8(0), Value::U32(record_id)]],
        )?;
        Ok(())
    }

    pub fn reset_sync_flags(&mut self, db_handle: u8) -> Result<()> {
        self.execute(&requests::RESET_SYNC_FLAGS, &[&[Value::U8(db_handle)]])?;
        Ok(())
    }

    pub fn add_sync_log_entry(&mut self, text: &str) -> Result<()> {
        self.execute(
            &requests::ADD_SYNC_LOG_ENTRY,
            &[&[Value::Str(text.to_string())]],
        )?;
        Ok(())
    }

    pub fn open_conduit(&mut self) -> Result<()> {
        self.execute(&requests::OPEN_CONDUIT, &[])?;
        Ok(())
    }

    /// Tell the device the session is over so it returns to its main screen
    pub fn end_of_sync(&mut self, status: u16) -> Result<()> {
        self.execute(&requests::END_OF_SYNC, &[&[Value::U16(status)]])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// MessageLink that records requests and plays back canned responses
    struct ScriptedLink {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        responses: VecDeque<Vec<u8>>,
    }

    impl MessageLink for ScriptedLink {
        fn send_message(&mut self, payload: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        fn recv_message(&mut self) -> Result<Vec<u8>> {
            self.responses
                .pop_front()
                .ok_or_else(|| Error::Timeout("scripted response".to_string()))
        }
    }

    fn connection(responses: Vec<Vec<u8>>) -> (DlpConnection, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let link = ScriptedLink {
            sent: Arc::clone(&sent),
            responses: responses.into(),
        };
        (DlpConnection::new(Box::new(link)), sent)
    }

    #[test]
    fn test_read_sys_info_loopback() {
        // 0x92 = 0x12 | response bit, one arg, errno 0,
        // tiny arg id 0x20 with a 10-byte payload
        let mut response = vec![0x92, 0x01, 0x00, 0x00, 0x20, 0x0A];
        response.extend_from_slice(&[0x00, 0x03, 0x50, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00]);

        let (mut dlp, _) = connection(vec![response]);
        let info = dlp.read_sys_info().unwrap();

        assert_eq!(info.rom_version, 0x00035001);
        assert_eq!(info.localization_id, 0x00000001);
        assert!(info.product_id.is_empty());
    }

    #[test]
    fn test_request_encoding() {
        let response = vec![0x92, 0x01, 0x00, 0x00, 0x20, 0x0A, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let (mut dlp, sent) = connection(vec![response]);
        dlp.read_sys_info().unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], vec![0x12, 0x00]); // command, zero args
    }

    #[test]
    fn test_command_mismatch_rejected() {
        // Response claims to answer command 0x13
        let response = vec![0x93, 0x00, 0x00, 0x00];
        let (mut dlp, _) = connection(vec![response]);
        let err = dlp.read_sys_info().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_error_code_surfaced() {
        let response = vec![0x97, 0x00, 0x00, 0x05]; // OpenDB, errno = not found
        let (mut dlp, _) = connection(vec![response]);
        let err = dlp.open_db(0, requests::OPEN_READ, "MemoDB").unwrap_err();
        assert!(matches!(err, Error::Dlp(STATUS_NOT_FOUND)));
    }

    #[test]
    fn test_argument_count_mismatch_rejected() {
        // ReadSysInfo response claiming two arguments
        let response = vec![0x92, 0x02, 0x00, 0x00, 0x20, 0x00, 0x21, 0x00];
        let (mut dlp, _) = connection(vec![response]);
        let err = dlp.read_sys_info().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_unexpected_argument_id_rejected() {
        let mut response = vec![0x92, 0x01, 0x00, 0x00, 0x25, 0x0A];
        response.extend_from_slice(&[0u8; 10]);
        let (mut dlp, _) = connection(vec![response]);
        let err = dlp.read_sys_info().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_end_of_sync_encoding() {
        let (mut dlp, _) = connection(vec![vec![0xAF, 0x00, 0x00, 0x00]]);
        dlp.end_of_sync(requests::SYNC_STATUS_OK).unwrap();
    }
}
