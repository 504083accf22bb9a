// SPDX-License-Identifier: BSD-3-Clause
//! MediaTek DA XML (v6) dialect.
//!
//! Same length-prefixed envelope as XFlash, but every command is an XML
//! document: `<da><version>1.0</version><command>CMD:...</command><arg>...`
//! and the agent answers with `<da><command>CMD:ACK</command><result>OK`
//! (or a failure string). Data phases ride in plain message frames between
//! XML acknowledgements. Partitions are addressed by name; the agent owns
//! the layout.

use xmltree::{Element, EmitterConfig, XMLNode};

use crate::brom::MtkDevice;
use crate::error::{Error, ProtocolError, Result};
use crate::xflash::{DT_MESSAGE, DT_PROTOCOL_FLOW, read_frame, send_frame};

pub const XML_CMD_GET_HW_INFO: &str = "CMD:GET-HW-INFO";
pub const XML_CMD_READ_PARTITION: &str = "CMD:READ-PARTITION";
pub const XML_CMD_WRITE_PARTITION: &str = "CMD:WRITE-PARTITION";
pub const XML_CMD_ERASE_PARTITION: &str = "CMD:ERASE-PARTITION";
pub const XML_CMD_SET_BOOT_MODE: &str = "CMD:SET-BOOT-MODE";

fn unexpected(phase: &str, detail: impl Into<String>) -> Error {
    ProtocolError::UnexpectedResponse {
        phase: format!("da-xml {phase}"),
        detail: detail.into(),
    }
    .into()
}

fn text_child(name: &str, text: impl Into<String>) -> XMLNode {
    let mut el = Element::new(name);
    el.children.push(XMLNode::Text(text.into()));
    XMLNode::Element(el)
}

fn child_text(el: &Element, name: &str) -> Option<String> {
    el.get_child(name)?.get_text().map(|t| t.into_owned())
}

fn build_command(cmd: &str, args: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut root = Element::new("da");
    root.children.push(text_child("version", "1.0"));
    root.children.push(text_child("command", cmd));
    if !args.is_empty() {
        let mut arg = Element::new("arg");
        for (k, v) in args {
            arg.children.push(text_child(k, *v));
        }
        root.children.push(XMLNode::Element(arg));
    }

    let mut buf = Vec::new();
    root.write_with_config(
        &mut buf,
        EmitterConfig::new()
            .perform_indent(false)
            .write_document_declaration(true),
    )
    .map_err(|e| unexpected("emit", e.to_string()))?;
    Ok(buf)
}

fn parse_response(payload: &[u8], phase: &str) -> Result<Element> {
    let doc =
        Element::parse(payload).map_err(|e| unexpected(phase, e.to_string()))?;
    if doc.name != "da" {
        return Err(unexpected(phase, format!("unexpected root <{}>", doc.name)));
    }
    match child_text(&doc, "result").as_deref() {
        Some("OK") | None => Ok(doc),
        Some(failure) => Err(ProtocolError::CommandRejected {
            device_msg: failure.to_owned(),
        }
        .into()),
    }
}

fn read_response(dev: &mut MtkDevice, phase: &str) -> Result<Element> {
    let (_, payload) = read_frame(dev)?;
    parse_response(&payload, phase)
}

fn send_command(
    dev: &mut MtkDevice,
    cmd: &str,
    args: &[(&str, &str)],
    phase: &str,
) -> Result<Element> {
    let doc = build_command(cmd, args)?;
    send_frame(dev, DT_PROTOCOL_FLOW, &doc)?;
    read_response(dev, phase)
}

fn send_host_ack(dev: &mut MtkDevice) -> Result<()> {
    let mut root = Element::new("da");
    root.children.push(text_child("command", "CMD:ACK"));
    root.children.push(text_child("result", "OK"));
    let mut buf = Vec::new();
    root.write_with_config(
        &mut buf,
        EmitterConfig::new()
            .perform_indent(false)
            .write_document_declaration(true),
    )
    .map_err(|e| unexpected("emit", e.to_string()))?;
    send_frame(dev, DT_PROTOCOL_FLOW, &buf)
}

/// Hardware summary plus the agent's partition catalogue.
#[derive(Debug, Clone, Default)]
pub struct XmlHwInfo {
    pub storage: Option<String>,
    pub chunk_size: Option<usize>,
    /// (name, start byte, length)
    pub partitions: Vec<(String, u64, u64)>,
}

fn parse_number(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// `CMD:GET-HW-INFO`: storage kind, preferred chunk size and the partition
/// table, all in one response document.
pub fn daxml_get_hw_info(dev: &mut MtkDevice) -> Result<XmlHwInfo> {
    let doc = send_command(dev, XML_CMD_GET_HW_INFO, &[], "get-hw-info")?;

    let mut info = XmlHwInfo {
        storage: child_text(&doc, "storage"),
        chunk_size: child_text(&doc, "chunk_size")
            .and_then(|s| parse_number(&s))
            .map(|n| n as usize),
        partitions: Vec::new(),
    };
    for node in &doc.children {
        let XMLNode::Element(el) = node else { continue };
        if el.name != "partition" {
            continue;
        }
        let (Some(name), Some(start), Some(len)) = (
            el.attributes.get("name"),
            el.attributes.get("start").and_then(|s| parse_number(s)),
            el.attributes.get("length").and_then(|s| parse_number(s)),
        ) else {
            return Err(unexpected("get-hw-info", "malformed <partition> entry"));
        };
        info.partitions.push((name.clone(), start, len));
    }

    if let Some(chunk) = info.chunk_size {
        dev.max_packet = chunk;
    }
    Ok(info)
}

/// `CMD:WRITE-PARTITION`: announce the write, then stream chunks, each
/// acknowledged by the agent; a final acknowledgement closes the phase.
pub fn daxml_write_partition<I>(dev: &mut MtkDevice, name: &str, total: u64, chunks: I) -> Result<()>
where
    I: IntoIterator<Item = Result<Vec<u8>>>,
{
    let total_str = format!("{total:#x}");
    send_command(
        dev,
        XML_CMD_WRITE_PARTITION,
        &[("partition", name), ("length", total_str.as_str())],
        "write-partition",
    )?;

    let mut sent: u64 = 0;
    for chunk in chunks {
        let chunk = chunk?;
        dev.feed_watchdog();
        send_frame(dev, DT_MESSAGE, &chunk)?;
        read_response(dev, "write-partition data")?;
        sent += chunk.len() as u64;
    }
    if sent != total {
        return Err(ProtocolError::DataPhaseMismatch {
            expected: total,
            actual: sent,
        }
        .into());
    }
    read_response(dev, "write-partition close")?;
    Ok(())
}

/// `CMD:READ-PARTITION`: window read by partition name. Data frames are
/// acknowledged host-side so a slow sink throttles the agent.
pub fn daxml_read_partition(
    dev: &mut MtkDevice,
    name: &str,
    offset: u64,
    length: u64,
    out: &mut dyn std::io::Write,
) -> Result<()> {
    let offset_str = format!("{offset:#x}");
    let length_str = format!("{length:#x}");
    send_command(
        dev,
        XML_CMD_READ_PARTITION,
        &[
            ("partition", name),
            ("offset", offset_str.as_str()),
            ("length", length_str.as_str()),
        ],
        "read-partition",
    )?;

    let mut received: u64 = 0;
    while received < length {
        dev.feed_watchdog();
        let (_, payload) = read_frame(dev)?;
        if payload.is_empty() || received + payload.len() as u64 > length {
            return Err(ProtocolError::DataPhaseMismatch {
                expected: length,
                actual: received + payload.len() as u64,
            }
            .into());
        }
        out.write_all(&payload)?;
        received += payload.len() as u64;
        send_host_ack(dev)?;
    }
    read_response(dev, "read-partition close")?;
    Ok(())
}

/// `CMD:ERASE-PARTITION`.
pub fn daxml_erase_partition(dev: &mut MtkDevice, name: &str) -> Result<()> {
    send_command(
        dev,
        XML_CMD_ERASE_PARTITION,
        &[("partition", name)],
        "erase-partition",
    )?;
    Ok(())
}

/// `CMD:SET-BOOT-MODE`: leave flashing mode ("reboot", "off", "fastboot").
pub fn daxml_set_boot_mode(dev: &mut MtkDevice, mode: &str) -> Result<()> {
    send_command(
        dev,
        XML_CMD_SET_BOOT_MODE,
        &[("mode", mode)],
        "set-boot-mode",
    )?;
    Ok(())
}

/// Raw escape hatch for reserved `CMD:` strings (`CMD:READ-REGISTER` and
/// friends). Returns the raw response document.
pub fn daxml_execute_raw(
    dev: &mut MtkDevice,
    cmd: &str,
    args: &[(&str, &str)],
) -> Result<Element> {
    if !cmd.starts_with("CMD:") {
        return Err(Error::InvalidArgument(format!(
            "'{cmd}' is not a CMD:-prefixed DA command"
        )));
    }
    send_command(dev, cmd, args, "raw command")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use crate::xflash::DA_MAGIC;

    fn frame(dtype: u32, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend(DA_MAGIC.to_le_bytes());
        f.extend(dtype.to_le_bytes());
        f.extend((payload.len() as u32).to_le_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn ok_response() -> Vec<u8> {
        frame(
            DT_PROTOCOL_FLOW,
            br#"<?xml version="1.0"?><da><command>CMD:ACK</command><result>OK</result></da>"#,
        )
    }

    fn device(script: ScriptedTransport) -> MtkDevice {
        MtkDevice::new(Box::new(script))
    }

    #[test]
    fn commands_emit_parseable_documents() {
        let doc = build_command("CMD:WRITE-PARTITION", &[("partition", "boot")]).unwrap();
        let parsed = Element::parse(&doc[..]).unwrap();
        assert_eq!(parsed.name, "da");
        assert_eq!(
            child_text(&parsed, "command").as_deref(),
            Some("CMD:WRITE-PARTITION")
        );
        let arg = parsed.get_child("arg").unwrap();
        assert_eq!(child_text(arg, "partition").as_deref(), Some("boot"));
    }

    #[test]
    fn hw_info_collects_partitions_and_chunk_size() {
        let response = br#"<?xml version="1.0"?><da><command>CMD:ACK</command><result>OK</result><storage>emmc</storage><chunk_size>0x10000</chunk_size><partition name="boot" start="0x8000" length="0x2000"/><partition name="system" start="0xA000" length="0x40000"/></da>"#;

        let script = ScriptedTransport::new()
            .expect(frame(
                DT_PROTOCOL_FLOW,
                &build_command(XML_CMD_GET_HW_INFO, &[]).unwrap(),
            ))
            .reply(frame(DT_PROTOCOL_FLOW, response));

        let mut dev = device(script);
        let info = daxml_get_hw_info(&mut dev).unwrap();
        assert_eq!(info.storage.as_deref(), Some("emmc"));
        assert_eq!(info.chunk_size, Some(0x10000));
        assert_eq!(info.partitions.len(), 2);
        assert_eq!(info.partitions[0], ("boot".to_owned(), 0x8000, 0x2000));
        assert_eq!(dev.max_packet, 0x10000);
    }

    #[test]
    fn write_partition_follows_the_ack_cadence() {
        let chunk = vec![0x33_u8; 64];
        let script = ScriptedTransport::new()
            .expect(frame(
                DT_PROTOCOL_FLOW,
                &build_command(
                    XML_CMD_WRITE_PARTITION,
                    &[("partition", "boot"), ("length", "0x40")],
                )
                .unwrap(),
            ))
            .reply(ok_response())
            .expect(frame(DT_MESSAGE, &chunk))
            .reply(ok_response())
            .reply(ok_response());

        daxml_write_partition(&mut device(script), "boot", 64, vec![Ok(chunk.clone())]).unwrap();
    }

    #[test]
    fn failure_result_text_reaches_the_caller() {
        let failure = frame(
            DT_PROTOCOL_FLOW,
            br#"<?xml version="1.0"?><da><command>CMD:ACK</command><result>ERR_PARTITION_NOT_FOUND</result></da>"#,
        );
        let script = ScriptedTransport::new()
            .expect(frame(
                DT_PROTOCOL_FLOW,
                &build_command(XML_CMD_ERASE_PARTITION, &[("partition", "nope")]).unwrap(),
            ))
            .reply(failure);

        let err = daxml_erase_partition(&mut device(script), "nope").unwrap_err();
        match err {
            Error::Protocol(ProtocolError::CommandRejected { device_msg }) => {
                assert_eq!(device_msg, "ERR_PARTITION_NOT_FOUND");
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn read_partition_assembles_windows() {
        let script = ScriptedTransport::new()
            .expect(frame(
                DT_PROTOCOL_FLOW,
                &build_command(
                    XML_CMD_READ_PARTITION,
                    &[("partition", "nvram"), ("offset", "0x0"), ("length", "0x6")],
                )
                .unwrap(),
            ))
            .reply(ok_response())
            .reply(frame(DT_MESSAGE, &[1, 2, 3]))
            .expect({
                let mut root = Element::new("da");
                root.children.push(text_child("command", "CMD:ACK"));
                root.children.push(text_child("result", "OK"));
                let mut buf = Vec::new();
                root.write_with_config(
                    &mut buf,
                    EmitterConfig::new()
                        .perform_indent(false)
                        .write_document_declaration(true),
                )
                .unwrap();
                frame(DT_PROTOCOL_FLOW, &buf)
            })
            .reply(frame(DT_MESSAGE, &[4, 5, 6]))
            .expect({
                let mut root = Element::new("da");
                root.children.push(text_child("command", "CMD:ACK"));
                root.children.push(text_child("result", "OK"));
                let mut buf = Vec::new();
                root.write_with_config(
                    &mut buf,
                    EmitterConfig::new()
                        .perform_indent(false)
                        .write_document_declaration(true),
                )
                .unwrap();
                frame(DT_PROTOCOL_FLOW, &buf)
            })
            .reply(ok_response());

        let mut out = Vec::new();
        daxml_read_partition(&mut device(script), "nvram", 0, 6, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 5, 6]);
    }
}
