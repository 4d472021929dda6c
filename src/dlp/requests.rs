//! DLP command tables
//!
//! One static `CommandDesc` per command, consulted by the generic codec in
//! [`super::schema`], plus the typed views the sync engine works with.

use super::schema::{ArgDesc, Codec, CommandDesc, DlpDateTime, Value, field};
use crate::error::{Error, Result};

// Command ids (responses set the high bit)
pub const CMD_READ_USER_INFO: u8 = 0x10;
pub const CMD_WRITE_USER_INFO: u8 = 0x11;
pub const CMD_READ_SYS_INFO: u8 = 0x12;
pub const CMD_READ_DB_LIST: u8 = 0x16;
pub const CMD_OPEN_DB: u8 = 0x17;
pub const CMD_CREATE_DB: u8 = 0x18;
pub const CMD_CLOSE_DB: u8 = 0x19;
pub const CMD_DELETE_DB: u8 = 0x1A;
pub const CMD_READ_NEXT_MODIFIED_REC: u8 = 0x1F;
pub const CMD_READ_RECORD_BY_INDEX: u8 = 0x20;
pub const CMD_WRITE_RECORD: u8 = 0x21;
pub const CMD_DELETE_RECORD: u8 = 0x22;
pub const CMD_ADD_SYNC_LOG_ENTRY: u8 = 0x2A;
pub const CMD_READ_OPEN_DB_INFO: u8 = 0x2B;
pub const CMD_RESET_SYNC_FLAGS: u8 = 0x2D;
pub const CMD_OPEN_CONDUIT: u8 = 0x2E;
pub const CMD_END_OF_SYNC: u8 = 0x2F;

// OpenDB mode flags
pub const OPEN_READ: u8 = 0x80;
pub const OPEN_WRITE: u8 = 0x40;
pub const OPEN_EXCLUSIVE: u8 = 0x20;
pub const OPEN_SECRET: u8 = 0x10;

// ReadDBList scope flags
pub const DB_LIST_RAM: u8 = 0x80;
pub const DB_LIST_ROM: u8 = 0x40;

// WriteUserInfo modified-field flags
pub const MOD_USER_ID: u8 = 0x80;
pub const MOD_SYNC_PC: u8 = 0x40;
pub const MOD_SYNC_DATE: u8 = 0x20;
pub const MOD_USER_NAME: u8 = 0x10;

// EndOfSync status codes
pub const SYNC_STATUS_OK: u16 = 0x00;
pub const SYNC_STATUS_ERROR: u16 = 0x01;

const NO_ARGS: &[ArgDesc] = &[];

pub static READ_SYS_INFO: CommandDesc = CommandDesc {
    name: "ReadSysInfo",
    command: CMD_READ_SYS_INFO,
    request: NO_ARGS,
    response: &[ArgDesc {
        fields: &[
            field("rom_version", Codec::U32),
            field("localization_id", Codec::U32),
            field("reserved", Codec::U8),
            field("product_id_size", Codec::U8),
            field("product_id", Codec::Rest),
        ],
    }],
};

pub static READ_USER_INFO: CommandDesc = CommandDesc {
    name: "ReadUserInfo",
    command: CMD_READ_USER_INFO,
    request: NO_ARGS,
    response: &[ArgDesc {
        fields: &[
            field("user_id", Codec::U32),
            field("viewer_id", Codec::U32),
            field("last_sync_pc", Codec::U32),
            field("succ_sync_date", Codec::DateTime),
            field("last_sync_date", Codec::DateTime),
            field("username_len", Codec::U8),
            field("password_len", Codec::U8),
            field("names", Codec::Rest),
        ],
    }],
};

pub static WRITE_USER_INFO: CommandDesc = CommandDesc {
    name: "WriteUserInfo",
    command: CMD_WRITE_USER_INFO,
    request: &[ArgDesc {
        fields: &[
            field("user_id", Codec::U32),
            field("viewer_id", Codec::U32),
            field("last_sync_pc", Codec::U32),
            field("last_sync_date", Codec::DateTime),
            field("modified_flags", Codec::U8),
            field("username_len", Codec::U8),
            field("username", Codec::Rest),
        ],
    }],
    response: NO_ARGS,
};

const DB_INFO_FIELDS: &[super::schema::FieldDesc] = &[
    field("size", Codec::U8),
    field("misc_flags", Codec::U8),
    field("db_flags", Codec::U16),
    field("type", Codec::FixedBytes(4)),
    field("creator", Codec::FixedBytes(4)),
    field("version", Codec::U16),
    field("modification_number", Codec::U32),
    field("create_date", Codec::DateTime),
    field("modify_date", Codec::DateTime),
    field("backup_date", Codec::DateTime),
    field("index", Codec::U16),
    field("name", Codec::CStr),
];

pub static READ_DB_LIST: CommandDesc = CommandDesc {
    name: "ReadDBList",
    command: CMD_READ_DB_LIST,
    request: &[ArgDesc {
        fields: &[
            field("flags", Codec::U8),
            field("card_no", Codec::U8),
            field("start_index", Codec::U16),
        ],
    }],
    response: &[ArgDesc {
        fields: &[
            field("last_index", Codec::U16),
            field("list_flags", Codec::U8),
            field("databases", Codec::Array(DB_INFO_FIELDS)),
        ],
    }],
};

pub static OPEN_DB: CommandDesc = CommandDesc {
    name: "OpenDB",
    command: CMD_OPEN_DB,
    request: &[ArgDesc {
        fields: &[
            field("card_no", Codec::U8),
            field("mode", Codec::U8),
            field("name", Codec::CStr),
        ],
    }],
    response: &[ArgDesc {
        fields: &[field("db_handle", Codec::U8)],
    }],
};

pub static CREATE_DB: CommandDesc = CommandDesc {
    name: "CreateDB",
    command: CMD_CREATE_DB,
    request: &[ArgDesc {
        fields: &[
            field("creator", Codec::FixedBytes(4)),
            field("type", Codec::FixedBytes(4)),
            field("card_no", Codec::U8),
            field("reserved", Codec::U8),
            field("db_flags", Codec::U16),
            field("version", Codec::U16),
            field("name", Codec::CStr),
        ],
    }],
    response: &[ArgDesc {
        fields: &[field("db_handle", Codec::U8)],
    }],
};

pub static CLOSE_DB: CommandDesc = CommandDesc {
    name: "CloseDB",
    command: CMD_CLOSE_DB,
    request: &[ArgDesc {
        fields: &[field("db_handle", Codec::U8)],
    }],
    response: NO_ARGS,
};

pub static DELETE_DB: CommandDesc = CommandDesc {
    name: "DeleteDB",
    command: CMD_DELETE_DB,
    request: &[ArgDesc {
        fields: &[
            field("card_no", Codec::U8),
            field("reserved", Codec::U8),
            field("name", Codec::CStr),
        ],
    }],
    response: NO_ARGS,
};

const RECORD_RESPONSE: &[ArgDesc] = &[ArgDesc {
    fields: &[
        field("record_id", Codec::U32),
        field("index", Codec::U16),
        field("size", Codec::U16),
        field("attributes", Codec::U8),
        field("category", Codec::U8),
        field("data", Codec::Rest),
    ],
}];

pub static READ_NEXT_MODIFIED_REC: CommandDesc = CommandDesc {
    name: "ReadNextModifiedRec",
    command: CMD_READ_NEXT_MODIFIED_REC,
    request: &[ArgDesc {
        fields: &[field("db_handle", Codec::U8)],
    }],
    response: RECORD_RESPONSE,
};

pub static READ_RECORD_BY_INDEX: CommandDesc = CommandDesc {
    name: "ReadRecordByIndex",
    command: CMD_READ_RECORD_BY_INDEX,
    request: &[ArgDesc {
        fields: &[
            field("db_handle", Codec::U8),
            field("reserved", Codec::U8),
            field("index", Codec::U16),
            field("offset", Codec::U16),
            field("max_size", Codec::U16),
        ],
    }],
    response: RECORD_RESPONSE,
};

pub static WRITE_RECORD: CommandDesc = CommandDesc {
    name: "WriteRecord",
    command: CMD_WRITE_RECORD,
    request: &[ArgDesc {
        fields: &[
            field("db_handle", Codec::U8),
            field("flags", Codec::U8),
            field("record_id", Codec::U32),
            field("attributes", Codec::U8),
            field("category", Codec::U8),
            field("data", Codec::Rest),
        ],
    }],
    response: &[ArgDesc {
        fields: &[field("record_id", Codec::U32)],
    }],
};

pub static DELETE_RECORD: CommandDesc = CommandDesc {
    name: "DeleteRecord",
    command: CMD_DELETE_RECORD,
    request: &[ArgDesc {
        fields: &[
            field("db_handle", Codec::U8),
            field("flags", Codec::U8),
            field("record_id", Codec::U32),
        ],
    }],
    response: NO_ARGS,
};

pub static READ_OPEN_DB_INFO: CommandDesc = CommandDesc {
    name: "ReadOpenDBInfo",
    command: CMD_READ_OPEN_DB_INFO,
    request: &[ArgDesc {
        fields: &[field("db_handle", Codec::U8)],
    }],
    response: &[ArgDesc {
        fields: &[field("record_count", Codec::U16)],
    }],
};

pub static ADD_SYNC_LOG_ENTRY: CommandDesc = CommandDesc {
    name: "AddSyncLogEntry",
    command: CMD_ADD_SYNC_LOG_ENTRY,
    request: &[ArgDesc {
        fields: &[field("text", Codec::CStr)],
    }],
    response: NO_ARGS,
};

pub static RESET_SYNC_FLAGS: CommandDesc = CommandDesc {
    name: "ResetSyncFlags",
    command: CMD_RESET_SYNC_FLAGS,
    request: &[ArgDesc {
        fields: &[field("db_handle", Codec::U8)],
    }],
    response: NO_ARGS,
};

pub static OPEN_CONDUIT: CommandDesc = CommandDesc {
    name: "OpenConduit",
    command: CMD_OPEN_CONDUIT,
    request: NO_ARGS,
    response: NO_ARGS,
};

pub static END_OF_SYNC: CommandDesc = CommandDesc {
    name: "EndOfSync",
    command: CMD_END_OF_SYNC,
    request: &[ArgDesc {
        fields: &[field("status", Codec::U16)],
    }],
    response: NO_ARGS,
};

// ============================================================================
// Typed views over decoded arguments
// ============================================================================

/// ReadSysInfo response
#[derive(Debug, Clone)]
pub struct SysInfo {
    pub rom_version: u32,
    pub localization_id: u32,
    pub product_id: Vec<u8>,
}

impl SysInfo {
    pub fn from_args(args: &[Vec<Value>]) -> Result<Self> {
        let v = single_arg(args, "ReadSysInfo")?;
        Ok(SysInfo {
            rom_version: v[0].as_u32()?,
            localization_id: v[1].as_u32()?,
            product_id: v[4].as_bytes()?.to_vec(),
        })
    }
}

/// ReadUserInfo response / WriteUserInfo source
#[derive(Debug, Clone, Default)]
pub struct UserInfo {
    pub user_id: u32,
    pub viewer_id: u32,
    pub last_sync_pc: u32,
    pub succ_sync_date: DlpDateTime,
    pub last_sync_date: DlpDateTime,
    pub username: String,
}

impl UserInfo {
    pub fn from_args(args: &[Vec<Value>]) -> Result<Self> {
        let v = single_arg(args, "ReadUserInfo")?;
        let username_len = v[5].as_u8()? as usize;
        let names = v[7].as_bytes()?;
        if names.len() < username_len {
            return Err(Error::Protocol(
                "user info shorter than declared name length".to_string(),
            ));
        }
        // The declared length includes the terminating NUL
        let name_bytes = &names[..username_len];
        let name_end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        Ok(UserInfo {
            user_id: v[0].as_u32()?,
            viewer_id: v[1].as_u32()?,
            last_sync_pc: v[2].as_u32()?,
            succ_sync_date: v[3].as_datetime()?,
            last_sync_date: v[4].as_datetime()?,
            username: String::from_utf8_lossy(&name_bytes[..name_end]).into_owned(),
        })
    }
}

/// One entry of the device's database directory
#[derive(Debug, Clone)]
pub struct DbInfo {
    pub misc_flags: u8,
    pub db_flags: u16,
    pub type_code: [u8; 4],
    pub creator: [u8; 4],
    pub version: u16,
    pub modification_number: u32,
    pub create_date: DlpDateTime,
    pub modify_date: DlpDateTime,
    pub backup_date: DlpDateTime,
    pub index: u16,
    pub name: String,
}

/// Set in `db_flags` when the database holds resources (PRC) not records
pub const DB_FLAG_RESOURCE: u16 = 0x0001;
/// Set in `db_flags` for read-only databases
pub const DB_FLAG_READ_ONLY: u16 = 0x0002;

impl DbInfo {
    pub fn from_values(v: &[Value]) -> Result<Self> {
        Ok(DbInfo {
            misc_flags: v[1].as_u8()?,
            db_flags: v[2].as_u16()?,
            type_code: fixed4(v[3].as_bytes()?)?,
            creator: fixed4(v[4].as_bytes()?)?,
            version: v[5].as_u16()?,
            modification_number: v[6].as_u32()?,
            create_date: v[7].as_datetime()?,
            modify_date: v[8].as_datetime()?,
            backup_date: v[9].as_datetime()?,
            index: v[10].as_u16()?,
            name: v[11].as_str()?.to_string(),
        })
    }

    pub fn is_resource(&self) -> bool {
        self.db_flags & DB_FLAG_RESOURCE != 0
    }
}

/// One record read from an open database
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub record_id: u32,
    pub index: u16,
    pub attributes: u8,
    pub category: u8,
    pub data: Vec<u8>,
}

pub const RECORD_ATTR_DELETED: u8 = 0x80;
pub const RECORD_ATTR_DIRTY: u8 = 0x40;
pub const RECORD_ATTR_BUSY: u8 = 0x20;
pub const RECORD_ATTR_SECRET: u8 = 0x10;

impl RecordInfo {
    pub fn from_args(args: &[Vec<Value>]) -> Result<Self> {
        let v = single_arg(args, "record response")?;
        Ok(RecordInfo {
            record_id: v[0].as_u32()?,
            index: v[1].as_u16()?,
            attributes: v[3].as_u8()?,
            category: v[4].as_u8()?,
            data: v[5].as_bytes()?.to_vec(),
        })
    }
}

fn single_arg<'a>(args: &'a [Vec<Value>], what: &str) -> Result<&'a Vec<Value>> {
    args.first()
        .ok_or_else(|| Error::Protocol(format!("{} missing argument", what)))
}

fn fixed4(bytes: &[u8]) -> Result<[u8; 4]> {
    bytes
        .try_into()
        .map_err(|_| Error::Protocol("expected 4-byte code".to_string()))
}
