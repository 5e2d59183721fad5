//! Capture file reading
//!
//! Both classic pcap and pcapng files are accepted; the format is picked
//! from the leading magic number.

use crate::error::CaptureResult;
use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::DataLink;
use std::io::{Chain, Cursor, Read};
use std::time::Duration;

/// Block type of a pcapng section header, which starts every pcapng file
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

type Prefixed<R> = Chain<Cursor<Vec<u8>>, R>;

enum Format<R: Read> {
    Pcap(PcapReader<Prefixed<R>>),
    PcapNg {
        reader: PcapNgReader<Prefixed<R>>,
        /// Link type of each interface in the current section
        links: Vec<DataLink>,
    },
}

/// One captured frame
#[derive(Debug)]
pub struct Frame<'a> {
    pub datalink: DataLink,
    pub timestamp: Duration,
    pub data: &'a [u8],
}

/// Frame source over a pcap or pcapng file
pub struct CaptureReader<R: Read> {
    format: Format<R>,
    frame: Vec<u8>,
    last_ts: Duration,
}

impl<R: Read> CaptureReader<R> {
    /// Detect the format and read the file header
    pub fn new(mut reader: R) -> CaptureResult<Self> {
        let mut magic = Vec::with_capacity(PCAPNG_MAGIC.len());
        reader
            .by_ref()
            .take(PCAPNG_MAGIC.len() as u64)
            .read_to_end(&mut magic)?;
        let is_pcapng = magic == PCAPNG_MAGIC;
        let reader = Cursor::new(magic).chain(reader);

        let format = if is_pcapng {
            Format::PcapNg {
                reader: PcapNgReader::new(reader)?,
                links: Vec::new(),
            }
        } else {
            Format::Pcap(PcapReader::new(reader)?)
        };
        Ok(Self {
            format,
            frame: Vec::new(),
            last_ts: Duration::ZERO,
        })
    }

    /// Short description of the file format for logging
    pub fn describe(&self) -> String {
        match &self.format {
            Format::Pcap(reader) => format!("pcap, datalink {:?}", reader.header().datalink),
            Format::PcapNg { .. } => "pcapng".to_string(),
        }
    }

    /// Next captured frame, `None` at end of input. Packets on interfaces
    /// without a description are skipped.
    pub fn next_frame(&mut self) -> CaptureResult<Option<Frame<'_>>> {
        let (datalink, timestamp) = match &mut self.format {
            Format::Pcap(reader) => {
                let datalink = reader.header().datalink;
                match reader.next_packet() {
                    None => return Ok(None),
                    Some(packet) => {
                        let packet = packet?;
                        self.frame.clear();
                        self.frame.extend_from_slice(&packet.data);
                        (datalink, packet.timestamp)
                    }
                }
            }
            Format::PcapNg { reader, links } => loop {
                let Some(block) = reader.next_block() else {
                    return Ok(None);
                };
                match block? {
                    Block::SectionHeader(_) => links.clear(),
                    Block::InterfaceDescription(interface) => links.push(interface.linktype),
                    Block::EnhancedPacket(packet) => {
                        let Some(&datalink) = links.get(packet.interface_id as usize) else {
                            continue;
                        };
                        self.frame.clear();
                        self.frame.extend_from_slice(&packet.data);
                        break (datalink, packet.timestamp);
                    }
                    Block::SimplePacket(packet) => {
                        // No timestamp of its own; reuse the previous one
                        let Some(&datalink) = links.first() else {
                            continue;
                        };
                        self.frame.clear();
                        self.frame.extend_from_slice(&packet.data);
                        break (datalink, self.last_ts);
                    }
                    _ => {}
                }
            },
        };

        self.last_ts = timestamp;
        Ok(Some(Frame {
            datalink,
            timestamp,
            data: &self.frame,
        }))
    }
}
