use echonet_protocol::{Eoj, Esv};

const EHD1: u8 = 0x10;
const EHD2: u8 = 0x81;
const MAX_FRAME_LEN: usize = 1500;
const MAX_EDT_LEN: usize = 244;
const MAX_OPC: usize = 255;
/// EHD1 + EHD2 + TID + SEOJ + DEOJ + ESV + OPC.
const HEADER_LEN: usize = 1 + 1 + 2 + 3 + 3 + 1 + 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("property 0x{epc:02x} EDT is {len} bytes, exceeding the 244-byte limit")]
    EdtTooLong { epc: u8, len: usize },
    #[error("frame declares {0} properties, exceeding the 255-property OPC limit")]
    TooManyProperties(usize),
}

/// A single `EPC | PDC | EDT` property tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub epc: u8,
    pub edt: Vec<u8>,
}

impl Property {
    pub fn new(epc: u8, edt: impl Into<Vec<u8>>) -> Self {
        Property {
            epc,
            edt: edt.into(),
        }
    }
}

/// A parsed ECHONET Lite frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tid: u16,
    pub seoj: Eoj,
    pub deoj: Eoj,
    pub esv: Esv,
    pub properties: Vec<Property>,
}

impl Frame {
    pub fn new(tid: u16, seoj: Eoj, deoj: Eoj, esv: Esv, properties: Vec<Property>) -> Self {
        Frame {
            tid,
            seoj,
            deoj,
            esv,
            properties,
        }
    }

    pub fn parse(buf: &[u8]) -> Result<Frame, CodecError> {
        if buf.len() > MAX_FRAME_LEN {
            return Err(CodecError::MalformedFrame(format!(
                "frame length {} exceeds {MAX_FRAME_LEN} bytes",
                buf.len()
            )));
        }
        if buf.len() < HEADER_LEN {
            return Err(CodecError::MalformedFrame(format!(
                "frame length {} is shorter than the {HEADER_LEN}-byte header",
                buf.len()
            )));
        }
        if buf[0] != EHD1 {
            return Err(CodecError::MalformedFrame(format!(
                "EHD1 byte 0x{:02x} != 0x{EHD1:02x}",
                buf[0]
            )));
        }
        if buf[1] != EHD2 {
            return Err(CodecError::MalformedFrame(format!(
                "EHD2 byte 0x{:02x} != 0x{EHD2:02x}",
                buf[1]
            )));
        }
        let tid = u16::from_be_bytes([buf[2], buf[3]]);
        let seoj = Eoj::from_bytes([buf[4], buf[5], buf[6]]);
        let deoj = Eoj::from_bytes([buf[7], buf[8], buf[9]]);
        let esv = Esv::from_byte(buf[10])
            .ok_or_else(|| CodecError::MalformedFrame(format!("unrecognized ESV 0x{:02x}", buf[10])))?;
        let opc = buf[11] as usize;

        let mut properties = Vec::with_capacity(opc);
        let mut cursor = HEADER_LEN;
        for _ in 0..opc {
            if cursor + 2 > buf.len() {
                return Err(CodecError::MalformedFrame(
                    "OPC declares more properties than bytes remain".to_owned(),
                ));
            }
            let epc = buf[cursor];
            let pdc = buf[cursor + 1] as usize;
            cursor += 2;
            if cursor + pdc > buf.len() {
                return Err(CodecError::MalformedFrame(format!(
                    "PDC {pdc} for EPC 0x{epc:02x} exceeds the remaining buffer"
                )));
            }
            let edt = buf[cursor..cursor + pdc].to_vec();
            cursor += pdc;
            properties.push(Property { epc, edt });
        }

        Ok(Frame {
            tid,
            seoj,
            deoj,
            esv,
            properties,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.properties.len() > MAX_OPC {
            return Err(CodecError::TooManyProperties(self.properties.len()));
        }
        for property in &self.properties {
            if property.edt.len() > MAX_EDT_LEN {
                return Err(CodecError::EdtTooLong {
                    epc: property.epc,
                    len: property.edt.len(),
                });
            }
        }

        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.push(EHD1);
        buf.push(EHD2);
        buf.extend_from_slice(&self.tid.to_be_bytes());
        buf.extend_from_slice(&self.seoj.to_bytes());
        buf.extend_from_slice(&self.deoj.to_bytes());
        buf.push(self.esv.to_byte());
        buf.push(self.properties.len() as u8);
        for property in &self.properties {
            buf.push(property.epc);
            buf.push(property.edt.len() as u8);
            buf.extend_from_slice(&property.edt);
        }

        if buf.len() > MAX_FRAME_LEN {
            return Err(CodecError::MalformedFrame(format!(
                "encoded frame length {} exceeds {MAX_FRAME_LEN} bytes",
                buf.len()
            )));
        }

        Ok(buf)
    }
}
