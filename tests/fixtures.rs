#![allow(dead_code)]
use evtx_bxml::{
    BinXmlFragment, BinXmlValue, EVTX_CHUNK_HEADER_SIZE, EVTX_CHUNK_SIZE, EVTX_FILE_HEADER_SIZE,
    EVTX_RECORD_HEADER_SIZE, NodeArena, NodeId, NodeKind,
};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Once;

static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
pub fn ensure_env_logger_initialized() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub const EVENT_NS: &str = "http://schemas.microsoft.com/win/2004/08/events/event";

/// 2012-03-14T04:17:43.354563Z
pub const SAMPLE_FILETIME: u64 = 129_761_722_633_545_630;

pub const TYPE_NULL: u8 = 0x00;
pub const TYPE_STRING: u8 = 0x01;
pub const TYPE_UINT8: u8 = 0x04;
pub const TYPE_UINT16: u8 = 0x06;
pub const TYPE_UINT32: u8 = 0x08;
pub const TYPE_UINT64: u8 = 0x0a;
pub const TYPE_GUID: u8 = 0x0f;
pub const TYPE_FILETIME: u8 = 0x11;
pub const TYPE_SID: u8 = 0x13;
pub const TYPE_HEX64: u8 = 0x15;
pub const TYPE_BXML: u8 = 0x21;

/// One slot of a substitution array.
pub enum Sub<'a> {
    Null,
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Hex64(u64),
    FileTime(u64),
    Str(&'a str),
    /// Any type tag with the bytes stored verbatim.
    Raw(u8, &'a [u8]),
    /// A nested fragment written in place.
    Bxml(&'a dyn Fn(&mut BxmlWriter)),
}

/// Writes BXML tokens whose first byte lands at chunk offset `base`.
///
/// Names are written inline the first time they are used and referenced by offset afterwards,
/// the way the event log service lays them out.
pub struct BxmlWriter {
    base: u32,
    buf: Vec<u8>,
    names: HashMap<String, u32>,
}

impl BxmlWriter {
    pub fn new(base: u32) -> Self {
        BxmlWriter::with_names(base, HashMap::new())
    }

    fn with_names(base: u32, names: HashMap<String, u32>) -> Self {
        BxmlWriter {
            base,
            buf: Vec::new(),
            names,
        }
    }

    /// Chunk offset of the next byte written.
    pub fn pos(&self) -> u32 {
        self.base + self.buf.len() as u32
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.bytes(&[v])
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.bytes(&v.to_le_bytes())
    }

    fn utf16(&mut self, s: &str) -> &mut Self {
        for unit in s.encode_utf16() {
            self.u16(unit);
        }
        self
    }

    fn reserve_u32(&mut self) -> usize {
        let at = self.buf.len();
        self.u32(0);
        at
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn name(&mut self, name: &str) {
        if let Some(&offset) = self.names.get(name) {
            self.u32(offset);
            return;
        }

        let entry = self.pos() + 4;
        self.names.insert(name.to_string(), entry);
        self.u32(entry);
        // next string offset, hash
        self.u32(0).u16(0);
        self.u16(name.encode_utf16().count() as u16)
            .utf16(name)
            .u16(0);
    }

    pub fn stream_start(&mut self) -> &mut Self {
        self.bytes(&[0x0f, 0x01, 0x01, 0x00])
    }

    pub fn end_of_stream(&mut self) -> &mut Self {
        self.u8(0x00)
    }

    /// A complete fragment: stream start, `body`, end of stream.
    pub fn document(&mut self, body: impl FnOnce(&mut Self)) -> &mut Self {
        self.stream_start();
        body(self);
        self.end_of_stream()
    }

    /// An element. It is written as an empty element when `content` writes nothing.
    pub fn element(
        &mut self,
        name: &str,
        attributes: impl FnOnce(&mut Self),
        content: impl FnOnce(&mut Self),
    ) -> &mut Self {
        let token_at = self.buf.len();
        self.u8(0x01).u16(0xffff);
        let size_at = self.reserve_u32();
        let data_start = self.buf.len();
        self.name(name);

        let attribute_size_at = self.reserve_u32();
        let attributes_start = self.buf.len();
        attributes(self);
        if self.buf.len() == attributes_start {
            self.buf.truncate(attribute_size_at);
        } else {
            self.buf[token_at] = 0x41;
            let len = (self.buf.len() - attributes_start) as u32;
            self.patch_u32(attribute_size_at, len);
        }

        let close_at = self.buf.len();
        self.u8(0x02);
        let content_start = self.buf.len();
        content(self);
        if self.buf.len() == content_start {
            self.buf[close_at] = 0x03;
        } else {
            self.u8(0x04);
        }

        let size = (self.buf.len() - data_start) as u32;
        self.patch_u32(size_at, size);
        self
    }

    pub fn attribute(&mut self, name: &str, value: impl FnOnce(&mut Self)) -> &mut Self {
        self.u8(0x06);
        self.name(name);
        value(self);
        self
    }

    /// A `ValueNode` holding a UTF-16 string.
    pub fn string(&mut self, s: &str) -> &mut Self {
        self.u8(0x05).u8(TYPE_STRING);
        self.u16(s.encode_utf16().count() as u16).utf16(s)
    }

    pub fn normal_substitution(&mut self, index: u16, value_type: u8) -> &mut Self {
        self.u8(0x0d).u16(index).u8(value_type)
    }

    pub fn conditional_substitution(&mut self, index: u16, value_type: u8) -> &mut Self {
        self.u8(0x0e).u16(index).u8(value_type)
    }

    /// A template instance followed by its definition. Returns the definition offset, which
    /// later records pass to [`BxmlWriter::template_reference`].
    pub fn template_instance(
        &mut self,
        template_id: u32,
        guid: [u8; 16],
        body: impl FnOnce(&mut Self),
    ) -> u32 {
        self.u8(0x0c).u8(0x01).u32(template_id);
        let offset = self.pos() + 4;
        self.u32(offset);

        // next template offset, guid, body size
        self.u32(0).bytes(&guid);
        let size_at = self.reserve_u32();
        let body_start = self.buf.len();
        self.document(body);
        let size = (self.buf.len() - body_start) as u32;
        self.patch_u32(size_at, size);

        offset
    }

    /// A template instance pointing at a definition stored elsewhere in the chunk.
    pub fn template_reference(&mut self, template_id: u32, offset: u32) -> &mut Self {
        self.u8(0x0c).u8(0x01).u32(template_id).u32(offset)
    }

    /// The substitution array: count, (size, type) descriptors, then the values.
    pub fn substitutions(&mut self, values: &[Sub<'_>]) -> &mut Self {
        self.u32(values.len() as u32);
        let table_at = self.buf.len();
        self.bytes(&vec![0; values.len() * 4]);

        for (i, value) in values.iter().enumerate() {
            let start = self.buf.len();
            let type_tag = match value {
                Sub::Null => TYPE_NULL,
                Sub::U8(v) => {
                    self.u8(*v);
                    TYPE_UINT8
                }
                Sub::U16(v) => {
                    self.u16(*v);
                    TYPE_UINT16
                }
                Sub::U32(v) => {
                    self.u32(*v);
                    TYPE_UINT32
                }
                Sub::U64(v) => {
                    self.u64(*v);
                    TYPE_UINT64
                }
                Sub::Hex64(v) => {
                    self.u64(*v);
                    TYPE_HEX64
                }
                Sub::FileTime(v) => {
                    self.u64(*v);
                    TYPE_FILETIME
                }
                Sub::Str(s) => {
                    self.utf16(s);
                    TYPE_STRING
                }
                Sub::Raw(type_tag, bytes) => {
                    self.bytes(bytes);
                    *type_tag
                }
                Sub::Bxml(fragment) => {
                    fragment(self);
                    TYPE_BXML
                }
            };

            let size = (self.buf.len() - start) as u16;
            let at = table_at + i * 4;
            self.buf[at..at + 2].copy_from_slice(&size.to_le_bytes());
            self.buf[at + 2] = type_tag;
        }

        self
    }
}

/// Builds one 64KiB chunk with valid checksums.
pub struct ChunkBuilder {
    data: Vec<u8>,
    names: HashMap<String, u32>,
    first_id: Option<u64>,
    last_id: u64,
    records: u64,
}

impl Default for ChunkBuilder {
    fn default() -> Self {
        ChunkBuilder::new()
    }
}

impl ChunkBuilder {
    pub fn new() -> Self {
        let mut data = vec![0_u8; EVTX_CHUNK_HEADER_SIZE];
        data[..8].copy_from_slice(b"ElfChnk\x00");
        ChunkBuilder {
            data,
            names: HashMap::new(),
            first_id: None,
            last_id: 0,
            records: 0,
        }
    }

    /// Chunk offset where the next record header starts.
    pub fn next_record_offset(&self) -> u32 {
        self.data.len() as u32
    }

    /// Appends a record whose BXML is produced by `fragment`.
    pub fn record(
        &mut self,
        record_id: u64,
        timestamp: u64,
        fragment: impl FnOnce(&mut BxmlWriter),
    ) -> &mut Self {
        let base = (self.data.len() + EVTX_RECORD_HEADER_SIZE) as u32;
        let mut writer = BxmlWriter::with_names(base, std::mem::take(&mut self.names));
        fragment(&mut writer);
        self.names = std::mem::take(&mut writer.names);

        self.raw_record(record_id, timestamp, &writer.into_bytes())
    }

    /// Appends a record around BXML bytes written elsewhere.
    pub fn raw_record(&mut self, record_id: u64, timestamp: u64, bxml: &[u8]) -> &mut Self {
        let size = (EVTX_RECORD_HEADER_SIZE + bxml.len() + 4) as u32;
        self.data.extend_from_slice(&[0x2a, 0x2a, 0x00, 0x00]);
        self.data.extend_from_slice(&size.to_le_bytes());
        self.data.extend_from_slice(&record_id.to_le_bytes());
        self.data.extend_from_slice(&timestamp.to_le_bytes());
        self.data.extend_from_slice(bxml);
        self.data.extend_from_slice(&size.to_le_bytes());

        self.first_id.get_or_insert(record_id);
        self.last_id = record_id;
        self.records += 1;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut data = self.data.clone();
        let first_id = self.first_id.unwrap_or(0);

        data[8..16].copy_from_slice(&first_id.to_le_bytes());
        data[16..24].copy_from_slice(&(first_id + self.records.saturating_sub(1)).to_le_bytes());
        data[24..32].copy_from_slice(&first_id.to_le_bytes());
        data[32..40].copy_from_slice(&self.last_id.to_le_bytes());
        data[40..44].copy_from_slice(&128_u32.to_le_bytes());
        let free_space = data.len() as u32;
        data[48..52].copy_from_slice(&free_space.to_le_bytes());

        let events_checksum = crc32fast::hash(&data[EVTX_CHUNK_HEADER_SIZE..]);
        data[52..56].copy_from_slice(&events_checksum.to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..120]);
        hasher.update(&data[128..EVTX_CHUNK_HEADER_SIZE]);
        data[124..128].copy_from_slice(&hasher.finalize().to_le_bytes());

        assert!(data.len() <= EVTX_CHUNK_SIZE, "chunk overflow");
        data.resize(EVTX_CHUNK_SIZE, 0);
        data
    }
}

/// A file image: header followed by `chunks`.
pub fn evtx_file(chunks: &[Vec<u8>]) -> Vec<u8> {
    let mut data = vec![0_u8; EVTX_FILE_HEADER_SIZE];
    data[..8].copy_from_slice(b"ElfFile\x00");
    data[16..24].copy_from_slice(&(chunks.len().saturating_sub(1) as u64).to_le_bytes());
    data[32..36].copy_from_slice(&128_u32.to_le_bytes());
    data[36..38].copy_from_slice(&1_u16.to_le_bytes());
    data[38..40].copy_from_slice(&3_u16.to_le_bytes());
    data[40..42].copy_from_slice(&4096_u16.to_le_bytes());
    data[42..44].copy_from_slice(&(chunks.len() as u16).to_le_bytes());
    let checksum = crc32fast::hash(&data[..120]);
    data[124..128].copy_from_slice(&checksum.to_le_bytes());

    for chunk in chunks {
        data.extend_from_slice(chunk);
    }
    data
}

pub const SYSTEM_TEMPLATE_GUID: [u8; 16] = [
    0x6d, 0x8b, 0x5e, 0x2b, 0x3a, 0x4f, 0x1b, 0x4c, 0x9d, 0x1e, 0x55, 0x12, 0x8a, 0xe3, 0x0b, 0x6f,
];
pub const BACKUP_TEMPLATE_GUID: [u8; 16] = [
    0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff, 0x00,
];

pub const PROVIDER_NAME: &str = "Microsoft-Windows-Eventlog";
pub const PROVIDER_GUID: &str = "{fc65ddd8-d6ef-4962-83d5-6e5cfe9ce148}";

pub const BACKUP_PATH: &str =
    "C:\\Windows\\System32\\Winevt\\Logs\\Archive-System-2012-03-14-04-17-39-932.evtx";

/// The `System` template shared by most events of the System log.
pub fn system_template(w: &mut BxmlWriter) {
    w.element(
        "Event",
        |w| {
            w.attribute("xmlns", |w| {
                w.string(EVENT_NS);
            });
        },
        |w| {
            w.element(
                "System",
                |_| {},
                |w| {
                    w.element(
                        "Provider",
                        |w| {
                            w.attribute("Name", |w| {
                                w.string(PROVIDER_NAME);
                            });
                            w.attribute("Guid", |w| {
                                w.string(PROVIDER_GUID);
                            });
                        },
                        |_| {},
                    );
                    w.element(
                        "EventID",
                        |w| {
                            w.attribute("Qualifiers", |w| {
                                w.conditional_substitution(4, TYPE_UINT16);
                            });
                        },
                        |w| {
                            w.conditional_substitution(3, TYPE_UINT16);
                        },
                    );
                    w.element("Version", |_| {}, |w| {
                        w.conditional_substitution(11, TYPE_UINT8);
                    });
                    w.element("Level", |_| {}, |w| {
                        w.conditional_substitution(0, TYPE_UINT8);
                    });
                    w.element("Task", |_| {}, |w| {
                        w.conditional_substitution(2, TYPE_UINT16);
                    });
                    w.element("Opcode", |_| {}, |w| {
                        w.conditional_substitution(1, TYPE_UINT8);
                    });
                    w.element("Keywords", |_| {}, |w| {
                        w.conditional_substitution(5, TYPE_HEX64);
                    });
                    w.element(
                        "TimeCreated",
                        |w| {
                            w.attribute("SystemTime", |w| {
                                w.conditional_substitution(6, TYPE_FILETIME);
                            });
                        },
                        |_| {},
                    );
                    w.element("EventRecordID", |_| {}, |w| {
                        w.conditional_substitution(10, TYPE_UINT64);
                    });
                    w.element(
                        "Correlation",
                        |w| {
                            w.attribute("ActivityID", |w| {
                                w.conditional_substitution(7, TYPE_GUID);
                            });
                            w.attribute("RelatedActivityID", |w| {
                                w.conditional_substitution(18, TYPE_GUID);
                            });
                        },
                        |_| {},
                    );
                    w.element(
                        "Execution",
                        |w| {
                            w.attribute("ProcessID", |w| {
                                w.conditional_substitution(8, TYPE_UINT32);
                            });
                            w.attribute("ThreadID", |w| {
                                w.conditional_substitution(9, TYPE_UINT32);
                            });
                        },
                        |_| {},
                    );
                    w.element("Channel", |_| {}, |w| {
                        w.string("System");
                    });
                    w.element("Computer", |_| {}, |w| {
                        w.string("WKS-WIN764BITB.shieldbase.local");
                    });
                    w.element(
                        "Security",
                        |w| {
                            w.attribute("UserID", |w| {
                                w.conditional_substitution(12, TYPE_SID);
                            });
                        },
                        |_| {},
                    );
                },
            );
            w.element("UserData", |_| {}, |w| {
                w.conditional_substitution(19, TYPE_BXML);
            });
        },
    );
}

/// The `UserData` payload of an event log backup notification.
pub fn backup_fragment(w: &mut BxmlWriter) {
    w.stream_start();
    w.template_instance(2, BACKUP_TEMPLATE_GUID, |w| {
        w.element(
            "AutoBackup",
            |w| {
                w.attribute("xmlns:auto-ns3", |w| {
                    w.string("http://schemas.microsoft.com/win/2004/08/events");
                });
                w.attribute("xmlns", |w| {
                    w.string("http://manifests.microsoft.com/win/2004/08/windows/eventlog");
                });
            },
            |w| {
                w.element("Channel", |_| {}, |w| {
                    w.normal_substitution(0, TYPE_STRING);
                });
                w.element("BackupPath", |_| {}, |w| {
                    w.normal_substitution(1, TYPE_STRING);
                });
            },
        );
    });
    w.substitutions(&[Sub::Str("System"), Sub::Str(BACKUP_PATH)]);
}

/// The 20 substitution values of the first record of a System log.
pub fn system_substitutions<'a>(
    record_id: u64,
    user_data: &'a dyn Fn(&mut BxmlWriter),
) -> Vec<Sub<'a>> {
    vec![
        Sub::U8(4),
        Sub::U8(0),
        Sub::U16(105),
        Sub::U16(105),
        Sub::Null,
        Sub::Hex64(0x0080_0000_0000_0000),
        Sub::FileTime(SAMPLE_FILETIME),
        Sub::Null,
        Sub::U32(820),
        Sub::U32(2868),
        Sub::U64(record_id),
        Sub::U8(0),
        Sub::Null,
        Sub::Null,
        Sub::Null,
        Sub::Null,
        Sub::Null,
        Sub::Null,
        Sub::Null,
        Sub::Bxml(user_data),
    ]
}

/// A chunk of `records` records numbered from `first_id`. The first record carries the `System`
/// template inline and the others reference it. Returns the chunk and the template offset.
pub fn system_log_chunk(first_id: u64, records: u64) -> (Vec<u8>, u32) {
    let mut chunk = ChunkBuilder::new();
    let mut template_offset = 0;

    chunk.record(first_id, SAMPLE_FILETIME, |w| {
        w.stream_start();
        template_offset = w.template_instance(1, SYSTEM_TEMPLATE_GUID, system_template);
        w.substitutions(&system_substitutions(first_id, &backup_fragment));
    });

    for id in first_id + 1..first_id + records {
        chunk.record(id, SAMPLE_FILETIME + id, |w| {
            w.stream_start();
            w.template_reference(1, template_offset);
            w.substitutions(&system_substitutions(id, &backup_fragment));
        });
    }

    (chunk.build(), template_offset)
}

/// Renders the node-kind skeleton of a decoded fragment, one node per line.
///
/// Leaves show their value, elements and attributes their name. Shared template definitions are
/// shown under the instance that references them, and a root's substitution array is shown as a
/// trailing `Substitutions` node.
pub fn extract_structure(fragment: &BinXmlFragment) -> String {
    let mut out = String::new();
    write_structure(fragment.arena(), fragment.root_id(), 0, &mut out);
    out
}

fn write_structure(arena: &NodeArena, id: NodeId, indent: usize, out: &mut String) {
    let node = &arena[id];
    let _ = write!(out, "{:indent$}{}", "", node.kind_name(), indent = indent * 2);

    match &node.kind {
        NodeKind::OpenStartElement(element) => {
            let _ = write!(out, " {}", element.name);
        }
        NodeKind::Attribute(attribute) => {
            let _ = write!(out, " {}", attribute.name);
        }
        NodeKind::Variant(value) => write_value(value, out),
        NodeKind::NormalSubstitution(d) | NodeKind::ConditionalSubstitution(d) => {
            let _ = write!(out, " #{}", d.substitution_index);
        }
        _ => {}
    }
    out.push('\n');

    for &child in &node.children {
        write_structure(arena, child, indent + 1, out);
    }

    match &node.kind {
        NodeKind::TemplateInstance(instance) => {
            if let Some(definition) = &instance.definition {
                write_structure(definition.arena(), definition.root_id(), indent + 1, out);
            }
        }
        NodeKind::Root(root) if !root.substitutions.is_empty() => {
            let _ = writeln!(out, "{:indent$}Substitutions", "", indent = (indent + 1) * 2);
            for substitution in &root.substitutions {
                let value = &substitution.value;
                let _ = write!(out, "{:indent$}{}", "", value.node_name(), indent = (indent + 2) * 2);
                write_value(value, out);
                out.push('\n');

                if let BinXmlValue::BinXmlType(nested) = value {
                    write_structure(arena, *nested, indent + 3, out);
                }
            }
        }
        _ => {}
    }
}

fn write_value(value: &BinXmlValue, out: &mut String) {
    let text = value.as_cow_str();
    if !text.is_empty() {
        let _ = write!(out, " {}", text);
    }
}
