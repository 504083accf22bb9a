// SPDX-License-Identifier: BSD-3-Clause
//! Qualcomm Firehose: XML-over-bulk with explicit data phases.
//!
//! Every host packet is one UTF-8 XML element wrapped in `<data>`; the
//! device answers with zero or more `<log>` packets and exactly one
//! `<response value="ACK|NAK">` terminal envelope. `<program>` and `<read>`
//! open raw data phases whose length is declared up front. The next command
//! must never be transmitted before the previous one's envelope arrived.

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::transport::Transport;
use crate::types::{FirehoseResetMode, FirehoseStatus, QcomChan};

/// The highest protocol version currently supported by the library
pub(crate) const FH_PROTO_VERSION_SUPPORTED: u32 = 1;

fn unexpected(phase: &str, detail: impl Into<String>) -> Error {
    ProtocolError::UnexpectedResponse {
        phase: format!("firehose {phase}"),
        detail: detail.into(),
    }
    .into()
}

pub(crate) fn rejected(logs: &[String]) -> Error {
    ProtocolError::CommandRejected {
        device_msg: if logs.is_empty() {
            "NAK with no diagnostic output".to_owned()
        } else {
            logs.join("; ")
        },
    }
    .into()
}

fn attr<'a>(attrs: &'a IndexMap<String, String>, key: &str, phase: &str) -> Result<&'a str> {
    attrs
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| unexpected(phase, format!("missing '{key}' attribute")))
}

pub(crate) fn attr_parse<F: std::str::FromStr>(
    attrs: &IndexMap<String, String>,
    key: &str,
    phase: &str,
) -> Result<F> {
    attr(attrs, key, phase)?
        .parse::<F>()
        .map_err(|_| unexpected(phase, format!("unparseable '{key}' attribute")))
}

/// Serialise one command element wrapped in the `<data>` envelope, exactly
/// as it goes onto the bus.
pub fn firehose_xml_setup(tag: &str, args: &[(&str, &str)]) -> Result<Vec<u8>> {
    let mut cmd = Element::new(tag);
    for (k, v) in args {
        cmd.attributes.insert((*k).to_owned(), (*v).to_owned());
    }
    let mut root = Element::new("data");
    root.children.push(XMLNode::Element(cmd));

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

fn firehose_send<T: QcomChan + ?Sized>(
    chan: &mut T,
    tag: &str,
    args: &[(&str, &str)],
) -> Result<()> {
    let pkt = firehose_xml_setup(tag, args)?;
    if pkt.len() > chan.fh_config().xml_buf_size {
        return Err(Error::InvalidArgument(format!(
            "command XML of {} bytes exceeds the device's {}-byte buffer",
            pkt.len(),
            chan.fh_config().xml_buf_size
        )));
    }
    tracing::trace!(tag, len = pkt.len(), "firehose command");
    chan.rw().send(&pkt)?;
    Ok(())
}

/// One incoming transfer may carry several concatenated XML documents;
/// split on the declaration and parse each.
fn parse_transfer(buf: &[u8]) -> Result<Vec<Element>> {
    let text = String::from_utf8_lossy(buf);
    let mut docs = Vec::new();
    let starts: Vec<usize> = text.match_indices("<?xml").map(|(i, _)| i).collect();
    if starts.is_empty() {
        // Some loaders skip the declaration
        docs.push(
            Element::parse(buf).map_err(|e| unexpected("response", e.to_string()))?,
        );
        return Ok(docs);
    }
    for (n, &start) in starts.iter().enumerate() {
        let end = starts.get(n + 1).copied().unwrap_or(text.len());
        let doc = Element::parse(text[start..end].as_bytes())
            .map_err(|e| unexpected("response", e.to_string()))?;
        docs.push(doc);
    }
    Ok(docs)
}

struct Incoming {
    /// Attributes of the terminal `<response>`, when one arrived
    response: Option<IndexMap<String, String>>,
    logs: Vec<String>,
}

fn read_transfer<T: QcomChan + ?Sized>(chan: &mut T) -> Result<Option<Incoming>> {
    let mut buf = vec![0u8; chan.fh_config().xml_buf_size.max(4096)];
    let n = chan.rw().recv(&mut buf)?;
    if n == 0 {
        return Ok(None);
    }

    let mut incoming = Incoming {
        response: None,
        logs: Vec::new(),
    };
    for doc in parse_transfer(&buf[..n])? {
        if doc.name != "data" {
            return Err(unexpected("response", format!("unexpected root <{}>", doc.name)));
        }
        for node in &doc.children {
            let XMLNode::Element(el) = node else { continue };
            match el.name.as_str() {
                "log" => {
                    let line = el
                        .attributes
                        .get("value")
                        .cloned()
                        .unwrap_or_default();
                    tracing::debug!(target: "firehose", "{line}");
                    incoming.logs.push(line);
                }
                "response" => {
                    incoming.response = Some(el.attributes.clone());
                }
                other => {
                    tracing::debug!(target: "firehose", "ignoring <{other}> element");
                }
            }
        }
    }
    Ok(Some(incoming))
}

/// Drain whatever the loader feels like printing (boot banners mostly)
/// until the bus goes quiet. Never an error if there is nothing to say.
pub fn firehose_drain_logs<T: QcomChan + ?Sized>(chan: &mut T) -> Result<Vec<String>> {
    let mut logs = Vec::new();
    while let Some(incoming) = read_transfer(chan)? {
        logs.extend(incoming.logs);
        if incoming.response.is_some() {
            break;
        }
    }
    Ok(logs)
}

/// Wait for the terminal envelope and hand its attributes to `parser`.
/// Intervening `<log>` elements are traced and collected for diagnostics.
pub fn firehose_read<T, P>(chan: &mut T, parser: P) -> Result<FirehoseStatus>
where
    T: QcomChan + ?Sized,
    P: Fn(&mut T, &IndexMap<String, String>) -> Result<FirehoseStatus>,
{
    loop {
        match read_transfer(chan)? {
            Some(incoming) => {
                if let Some(attrs) = incoming.response {
                    return parser(chan, &attrs);
                }
            }
            None => {
                return Err(TransportError::Timeout {
                    phase: "firehose response".into(),
                    elapsed: chan.rw().timeout(),
                }
                .into());
            }
        }
    }
}

/// Wait for the envelope; ACK returns its attributes, NAK turns the
/// device's log output into a [`ProtocolError::CommandRejected`].
pub fn firehose_expect_ack<T: QcomChan + ?Sized>(
    chan: &mut T,
    phase: &str,
) -> Result<IndexMap<String, String>> {
    let mut logs = Vec::new();
    loop {
        let Some(incoming) = read_transfer(chan)? else {
            return Err(TransportError::Timeout {
                phase: format!("firehose {phase}"),
                elapsed: chan.rw().timeout(),
            }
            .into());
        };
        logs.extend(incoming.logs);
        let Some(attrs) = incoming.response else {
            continue;
        };
        return match attr(&attrs, "value", phase)? {
            "ACK" => Ok(attrs),
            "NAK" => Err(rejected(&logs)),
            other => Err(unexpected(phase, format!("response value '{other}'"))),
        };
    }
}

/// Send the host capabilities. The reply needs
/// [`firehose_parser_configure_response`](crate::parsers::firehose_parser_configure_response),
/// which finishes the buffer-size negotiation.
pub fn firehose_configure<T: QcomChan + ?Sized>(chan: &mut T, verbose: bool) -> Result<()> {
    let cfg = chan.fh_config();
    let storage = cfg.storage_type.to_string();
    let payload = cfg.send_buffer_size.to_string();
    let skip_init = u8::from(cfg.skip_storage_init).to_string();
    firehose_send(
        chan,
        "configure",
        &[
            ("MemoryName", storage.as_str()),
            ("Verbose", if verbose { "1" } else { "0" }),
            ("AlwaysValidate", "0"),
            ("MaxDigestTableSizeInBytes", "8192"),
            ("MaxPayloadSizeToTargetInBytes", payload.as_str()),
            ("ZlpAwareHost", "1"),
            ("SkipStorageInit", skip_init.as_str()),
        ],
    )
}

fn storage_args(
    sector_size: usize,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: &str,
) -> Vec<(String, String)> {
    vec![
        ("SECTOR_SIZE_IN_BYTES".to_owned(), sector_size.to_string()),
        ("num_partition_sectors".to_owned(), num_sectors.to_string()),
        (
            "physical_partition_number".to_owned(),
            phys_part_idx.to_string(),
        ),
        ("start_sector".to_owned(), start_sector.to_owned()),
    ]
}

fn as_str_pairs(args: &[(String, String)]) -> Vec<(&str, &str)> {
    args.iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// `<program>`: declare a write, stream the data phase in negotiated
/// payload-sized pieces, then collect the closing envelope. A source that
/// runs dry early pads with zeroes, which is how whole-partition erase
/// writes are driven from a tiny buffer.
pub fn firehose_program_storage<T: QcomChan + ?Sized>(
    chan: &mut T,
    src: &mut dyn Read,
    label: &str,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<()> {
    let sector_size = chan.fh_config().storage_sector_size;
    let mut args = storage_args(sector_size, num_sectors, phys_part_idx, start_sector);
    if !label.is_empty() {
        args.push(("label".to_owned(), label.to_owned()));
    }
    args.push(("filename".to_owned(), String::new()));

    firehose_send(chan, "program", &as_str_pairs(&args))?;
    let attrs = firehose_expect_ack(chan, "program setup")?;
    if attr(&attrs, "rawmode", "program setup").unwrap_or("false") != "true" {
        tracing::debug!("device skipped rawmode attribute, continuing anyway");
    }

    let total = num_sectors as u64 * sector_size as u64;
    let chunk_len = (chan.fh_config().send_buffer_size / sector_size).max(1) * sector_size;
    let mut digest = chan.fh_config().read_back_verify.then(Sha256::new);
    let mut progress = chan
        .fh_config()
        .show_progress
        .then(|| pbr::ProgressBar::new(total));
    if let Some(bar) = progress.as_mut() {
        bar.set_units(pbr::Units::Bytes);
    }

    let mut remaining = total;
    let mut buf = vec![0u8; chunk_len];
    while remaining > 0 {
        chan.feed_watchdog();
        let want = std::cmp::min(remaining, chunk_len as u64) as usize;

        // Fill from the source, zero-padding once it runs dry
        let mut got = 0;
        while got < want {
            match src.read(&mut buf[got..want])? {
                0 => break,
                n => got += n,
            }
        }
        buf[got..want].fill(0);

        chan.rw().send(&buf[..want])?;
        if let Some(d) = digest.as_mut() {
            d.update(&buf[..want]);
        }
        if let Some(bar) = progress.as_mut() {
            bar.add(want as u64);
        }
        remaining -= want as u64;
    }
    if let Some(bar) = progress.as_mut() {
        bar.finish();
    }

    firehose_expect_ack(chan, "program data")?;

    if let Some(d) = digest {
        let expected: [u8; 32] = d.finalize().into();
        firehose_verify_digest(chan, &expected, num_sectors, phys_part_idx, start_sector)?;
    }
    Ok(())
}

/// `<read>`: mirror image of `<program>`, device to host.
pub fn firehose_read_storage<T: QcomChan + ?Sized>(
    chan: &mut T,
    out: &mut dyn Write,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: u64,
) -> Result<()> {
    let sector_size = chan.fh_config().storage_sector_size;
    let args = storage_args(
        sector_size,
        num_sectors,
        phys_part_idx,
        &start_sector.to_string(),
    );
    firehose_send(chan, "read", &as_str_pairs(&args))?;
    firehose_expect_ack(chan, "read setup")?;

    let total = num_sectors as u64 * sector_size as u64;
    let mut progress = chan
        .fh_config()
        .show_progress
        .then(|| pbr::ProgressBar::new(total));
    if let Some(bar) = progress.as_mut() {
        bar.set_units(pbr::Units::Bytes);
    }

    let mut remaining = total;
    let mut buf = vec![0u8; chan.fh_config().send_buffer_size.max(4096)];
    while remaining > 0 {
        chan.feed_watchdog();
        let want = std::cmp::min(remaining, buf.len() as u64) as usize;
        chan.rw().recv_exact(&mut buf[..want], "read data phase")?;
        out.write_all(&buf[..want])?;
        if let Some(bar) = progress.as_mut() {
            bar.add(want as u64);
        }
        remaining -= want as u64;
    }
    if let Some(bar) = progress.as_mut() {
        bar.finish();
    }

    firehose_expect_ack(chan, "read data")?;
    Ok(())
}

/// `<erase>`: storage-level erase of a sector range.
pub fn firehose_erase_storage<T: QcomChan + ?Sized>(
    chan: &mut T,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: u64,
) -> Result<()> {
    let args = storage_args(
        chan.fh_config().storage_sector_size,
        num_sectors,
        phys_part_idx,
        &start_sector.to_string(),
    );
    firehose_send(chan, "erase", &as_str_pairs(&args))?;
    firehose_expect_ack(chan, "erase")?;
    Ok(())
}

/// `<getsha256digest>`: have the device hash a sector range and report the
/// digest in its log output.
pub fn firehose_read_digest<T: QcomChan + ?Sized>(
    chan: &mut T,
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<String> {
    let args = storage_args(
        chan.fh_config().storage_sector_size,
        num_sectors,
        phys_part_idx,
        start_sector,
    );
    firehose_send(chan, "getsha256digest", &as_str_pairs(&args))?;

    let mut logs = Vec::new();
    loop {
        let Some(incoming) = read_transfer(chan)? else {
            return Err(TransportError::Timeout {
                phase: "firehose digest".into(),
                elapsed: chan.rw().timeout(),
            }
            .into());
        };
        logs.extend(incoming.logs);
        let Some(attrs) = incoming.response else {
            continue;
        };
        if attr(&attrs, "value", "digest")? != "ACK" {
            return Err(rejected(&logs));
        }
        break;
    }

    logs.iter()
        .rev()
        .find_map(|l| extract_hex_digest(l))
        .ok_or_else(|| unexpected("digest", "device reported no digest"))
}

/// Compare the device's digest of a sector range against the one the host
/// accumulated while programming it.
pub fn firehose_verify_digest<T: QcomChan + ?Sized>(
    chan: &mut T,
    expected: &[u8; 32],
    num_sectors: usize,
    phys_part_idx: u8,
    start_sector: &str,
) -> Result<()> {
    let device_hex = firehose_read_digest(chan, num_sectors, phys_part_idx, start_sector)?;
    let expected_hex = hex_string(expected);

    if !device_hex.eq_ignore_ascii_case(&expected_hex) {
        return Err(ProtocolError::DataPhaseMismatch {
            expected: num_sectors as u64 * chan.fh_config().storage_sector_size as u64,
            actual: 0,
        }
        .into());
    }
    tracing::info!("read-back digest matches");
    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn extract_hex_digest(line: &str) -> Option<String> {
    let mut run = String::new();
    for c in line.chars() {
        if c.is_ascii_hexdigit() {
            run.push(c);
            continue;
        }
        if run.len() == 64 {
            return Some(run);
        }
        run.clear();
    }
    (run.len() == 64).then_some(run)
}

/// `<patch>`: in-place edit of already-programmed sectors (GPT CRC fixups
/// in vendor patch files, mostly).
#[allow(clippy::too_many_arguments)]
pub fn firehose_patch<T: QcomChan + ?Sized>(
    chan: &mut T,
    byte_offset: u64,
    phys_part_idx: u8,
    size_in_bytes: u64,
    start_sector: &str,
    value: &str,
) -> Result<()> {
    let sector_size = chan.fh_config().storage_sector_size.to_string();
    let byte_offset = byte_offset.to_string();
    let phys = phys_part_idx.to_string();
    let size = size_in_bytes.to_string();
    firehose_send(
        chan,
        "patch",
        &[
            ("SECTOR_SIZE_IN_BYTES", sector_size.as_str()),
            ("byte_offset", byte_offset.as_str()),
            ("filename", "DISK"),
            ("physical_partition_number", phys.as_str()),
            ("size_in_bytes", size.as_str()),
            ("start_sector", start_sector),
            ("value", value),
        ],
    )?;
    firehose_expect_ack(chan, "patch")?;
    Ok(())
}

/// Storage geometry as reported by `<getstorageinfo>`.
#[derive(Debug, Clone, Default)]
pub struct FirehoseStorageInfo {
    pub total_sectors: Option<u64>,
    pub sector_size: Option<u64>,
    /// Raw device log lines, for operators who want the whole story
    pub raw: Vec<String>,
}

fn json_number(line: &str, key: &str) -> Option<u64> {
    let at = line.find(&format!("\"{key}\""))?;
    let rest = &line[at..];
    let colon = rest.find(':')?;
    let digits: String = rest[colon + 1..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// `<getstorageinfo>`: geometry probe used to bound partition writes and
/// size full-storage dumps.
pub fn firehose_get_storage_info<T: QcomChan + ?Sized>(
    chan: &mut T,
    phys_part_idx: u8,
) -> Result<FirehoseStorageInfo> {
    let phys = phys_part_idx.to_string();
    firehose_send(
        chan,
        "getstorageinfo",
        &[
            ("physical_partition_number", phys.as_str()),
            ("print_json", "1"),
        ],
    )?;

    let mut info = FirehoseStorageInfo::default();
    loop {
        let Some(incoming) = read_transfer(chan)? else {
            return Err(TransportError::Timeout {
                phase: "firehose getstorageinfo".into(),
                elapsed: chan.rw().timeout(),
            }
            .into());
        };
        for line in &incoming.logs {
            if info.total_sectors.is_none() {
                info.total_sectors = json_number(line, "total_blocks")
                    .or_else(|| json_number(line, "num_partition_sectors"));
            }
            if info.sector_size.is_none() {
                info.sector_size = json_number(line, "block_size");
            }
        }
        info.raw.extend(incoming.logs);
        if let Some(attrs) = incoming.response {
            if attr(&attrs, "value", "getstorageinfo")? != "ACK" {
                return Err(rejected(&info.raw));
            }
            break;
        }
    }
    Ok(info)
}

/// `<peek>`: read device memory. Returns the device's log lines, which is
/// where the values come back.
pub fn firehose_peek<T: QcomChan + ?Sized>(
    chan: &mut T,
    base: u64,
    len: u64,
) -> Result<Vec<String>> {
    let addr = format!("{base:#x}");
    let size = len.to_string();
    firehose_send(
        chan,
        "peek",
        &[("address64", addr.as_str()), ("size_in_bytes", size.as_str())],
    )?;

    let mut logs = Vec::new();
    loop {
        let Some(incoming) = read_transfer(chan)? else {
            return Err(TransportError::Timeout {
                phase: "firehose peek".into(),
                elapsed: chan.rw().timeout(),
            }
            .into());
        };
        logs.extend(incoming.logs);
        if let Some(attrs) = incoming.response {
            if attr(&attrs, "value", "peek")? != "ACK" {
                return Err(rejected(&logs));
            }
            return Ok(logs);
        }
    }
}

/// `<setbootablestoragedrive>`: mark a physical partition (eMMC boot LUN
/// and friends) bootable.
pub fn firehose_set_bootable<T: QcomChan + ?Sized>(chan: &mut T, part_idx: u8) -> Result<()> {
    let idx = part_idx.to_string();
    firehose_send(chan, "setbootablestoragedrive", &[("value", idx.as_str())])?;
    firehose_expect_ack(chan, "setbootablestoragedrive")?;
    Ok(())
}

/// Raw XML command escape hatch: send one bare `<tag/>` and collect the
/// device's log output up to the terminal envelope.
pub fn firehose_execute_raw<T: QcomChan + ?Sized>(
    chan: &mut T,
    tag: &str,
) -> Result<Vec<String>> {
    firehose_send(chan, tag, &[])?;
    let mut logs = Vec::new();
    loop {
        let Some(incoming) = read_transfer(chan)? else {
            return Err(TransportError::Timeout {
                phase: format!("firehose {tag}"),
                elapsed: chan.rw().timeout(),
            }
            .into());
        };
        logs.extend(incoming.logs);
        if let Some(attrs) = incoming.response {
            if attr(&attrs, "value", tag)? != "ACK" {
                return Err(rejected(&logs));
            }
            return Ok(logs);
        }
    }
}

/// `<nop>`: ask the device to do nothing, hopefully successfully.
pub fn firehose_nop<T: QcomChan + ?Sized>(chan: &mut T) -> Result<()> {
    firehose_send(chan, "nop", &[])?;
    firehose_expect_ack(chan, "nop")?;
    Ok(())
}

fn reset_wire_value(mode: FirehoseResetMode) -> &'static str {
    match mode {
        FirehoseResetMode::System => "reset",
        FirehoseResetMode::Off => "off",
        FirehoseResetMode::ResetToEdl => "reset_to_edl",
    }
}

/// `<power>`: reboot/power off, optionally after a delay.
pub fn firehose_reset<T: QcomChan + ?Sized>(
    chan: &mut T,
    mode: FirehoseResetMode,
    delay_secs: u32,
) -> Result<()> {
    let delay = delay_secs.to_string();
    firehose_send(
        chan,
        "power",
        &[
            ("value", reset_wire_value(mode)),
            ("DelayInSeconds", delay.as_str()),
        ],
    )?;
    firehose_expect_ack(chan, "power")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::{firehose_parser_ack_nak, firehose_parser_configure_response};
    use crate::testing::ScriptedTransport;
    use crate::types::{FirehoseConfig, QcomDevice, StorageKind};

    fn ack() -> Vec<u8> {
        br#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" rawmode="false"/></data>"#.to_vec()
    }

    fn rawmode_ack() -> Vec<u8> {
        br#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" rawmode="true"/></data>"#.to_vec()
    }

    fn nak_with_log(msg: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8" ?><data><log value="{msg}"/><response value="NAK"/></data>"#
        )
        .into_bytes()
    }

    fn device(script: ScriptedTransport, cfg: FirehoseConfig) -> QcomDevice {
        QcomDevice::new(Box::new(script), cfg)
    }

    fn small_cfg() -> FirehoseConfig {
        FirehoseConfig {
            storage_type: StorageKind::Ufs,
            storage_sector_size: 512,
            send_buffer_size: 1024,
            ..FirehoseConfig::default()
        }
    }

    #[test]
    fn xml_setup_round_trips_through_a_parser() {
        let pkt = firehose_xml_setup("program", &[("a", "1"), ("b", "2")]).unwrap();
        let doc = Element::parse(&pkt[..]).unwrap();
        assert_eq!(doc.name, "data");
        let XMLNode::Element(cmd) = &doc.children[0] else {
            panic!("no child element");
        };
        assert_eq!(cmd.name, "program");
        assert_eq!(cmd.attributes.get("a").unwrap(), "1");
        assert_eq!(cmd.attributes.get("b").unwrap(), "2");
    }

    #[test]
    fn nop_sends_and_acks() {
        let script = ScriptedTransport::new()
            .expect(firehose_xml_setup("nop", &[]).unwrap())
            .reply(ack());
        let mut dev = device(script, small_cfg());
        firehose_nop(&mut dev).unwrap();
    }

    #[test]
    fn nak_surfaces_the_device_log() {
        let script = ScriptedTransport::new()
            .expect(firehose_xml_setup("nop", &[]).unwrap())
            .reply(nak_with_log("storage not initialised"));
        let mut dev = device(script, small_cfg());
        let err = firehose_nop(&mut dev).unwrap_err();
        match err {
            Error::Protocol(ProtocolError::CommandRejected { device_msg }) => {
                assert!(device_msg.contains("storage not initialised"));
            }
            other => panic!("wrong error: {other:?}"),
        }
    }

    #[test]
    fn program_streams_the_declared_sector_count() {
        let cfg = small_cfg();
        // 4 sectors of 512, send buffer 1024: two data-phase transfers
        let image = vec![0xAB_u8; 2048];

        let cmd = firehose_xml_setup(
            "program",
            &[
                ("SECTOR_SIZE_IN_BYTES", "512"),
                ("num_partition_sectors", "4"),
                ("physical_partition_number", "0"),
                ("start_sector", "64"),
                ("label", "modem"),
                ("filename", ""),
            ],
        )
        .unwrap();

        let script = ScriptedTransport::new()
            .expect(cmd)
            .reply(rawmode_ack())
            .expect(image[..1024].to_vec())
            .expect(image[1024..].to_vec())
            .reply(ack());

        let mut dev = device(script, cfg);
        firehose_program_storage(&mut dev, &mut &image[..], "modem", 4, 0, "64").unwrap();
    }

    #[test]
    fn program_zero_pads_a_short_source() {
        let cfg = small_cfg();
        let short = vec![0x77_u8; 100];
        let mut padded = short.clone();
        padded.resize(512, 0);

        let cmd = firehose_xml_setup(
            "program",
            &[
                ("SECTOR_SIZE_IN_BYTES", "512"),
                ("num_partition_sectors", "1"),
                ("physical_partition_number", "0"),
                ("start_sector", "0"),
                ("filename", ""),
            ],
        )
        .unwrap();

        let script = ScriptedTransport::new()
            .expect(cmd)
            .reply(rawmode_ack())
            .expect(padded)
            .reply(ack());

        let mut dev = device(script, cfg);
        firehose_program_storage(&mut dev, &mut &short[..], "", 1, 0, "0").unwrap();
    }

    #[test]
    fn read_collects_the_data_phase() {
        let cfg = small_cfg();
        let data = vec![0x5C_u8; 1024];

        let cmd = firehose_xml_setup(
            "read",
            &[
                ("SECTOR_SIZE_IN_BYTES", "512"),
                ("num_partition_sectors", "2"),
                ("physical_partition_number", "0"),
                ("start_sector", "10"),
            ],
        )
        .unwrap();

        let script = ScriptedTransport::new()
            .expect(cmd)
            .reply(rawmode_ack())
            .reply(data.clone())
            .reply(ack());

        let mut dev = device(script, cfg);
        let mut out = Vec::new();
        firehose_read_storage(&mut dev, &mut out, 2, 0, 10).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn configure_accepts_the_devices_smaller_buffer() {
        let mut cfg = small_cfg();
        cfg.send_buffer_size = 1024 * 1024;

        let reply = br#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="NAK" MaxPayloadSizeToTargetInBytes="65536" MaxPayloadSizeToTargetInBytesSupported="65536" MaxXMLSizeInBytes="4096" Version="1" MinVersionSupported="1"/></data>"#.to_vec();

        let script = ScriptedTransport::new()
            .expect(
                firehose_xml_setup(
                    "configure",
                    &[
                        ("MemoryName", "ufs"),
                        ("Verbose", "0"),
                        ("AlwaysValidate", "0"),
                        ("MaxDigestTableSizeInBytes", "8192"),
                        ("MaxPayloadSizeToTargetInBytes", "1048576"),
                        ("ZlpAwareHost", "1"),
                        ("SkipStorageInit", "0"),
                    ],
                )
                .unwrap(),
            )
            .reply(reply);

        let mut dev = device(script, cfg);
        firehose_configure(&mut dev, false).unwrap();
        firehose_read(&mut dev, firehose_parser_configure_response).unwrap();
        assert_eq!(dev.fh_cfg.send_buffer_size, 65536);
        assert_eq!(dev.fh_cfg.xml_buf_size, 4096);
    }

    #[test]
    fn configure_upgrades_to_a_larger_supported_buffer() {
        let mut cfg = small_cfg();
        cfg.send_buffer_size = 65536;

        let first = br#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" MaxPayloadSizeToTargetInBytes="65536" MaxPayloadSizeToTargetInBytesSupported="1048576" MaxXMLSizeInBytes="4096" Version="1" MinVersionSupported="1"/></data>"#.to_vec();

        let reconfigure = firehose_xml_setup(
            "configure",
            &[
                ("MemoryName", "ufs"),
                ("Verbose", "0"),
                ("AlwaysValidate", "0"),
                ("MaxDigestTableSizeInBytes", "8192"),
                ("MaxPayloadSizeToTargetInBytes", "1048576"),
                ("ZlpAwareHost", "1"),
                ("SkipStorageInit", "0"),
            ],
        )
        .unwrap();

        let second = br#"<?xml version="1.0" encoding="UTF-8" ?><data><response value="ACK" MaxPayloadSizeToTargetInBytes="1048576" MaxPayloadSizeToTargetInBytesSupported="1048576" MaxXMLSizeInBytes="4096" Version="1" MinVersionSupported="1"/></data>"#.to_vec();

        let script = ScriptedTransport::new()
            .expect(
                firehose_xml_setup(
                    "configure",
                    &[
                        ("MemoryName", "ufs"),
                        ("Verbose", "0"),
                        ("AlwaysValidate", "0"),
                        ("MaxDigestTableSizeInBytes", "8192"),
                        ("MaxPayloadSizeToTargetInBytes", "65536"),
                        ("ZlpAwareHost", "1"),
                        ("SkipStorageInit", "0"),
                    ],
                )
                .unwrap(),
            )
            .reply(first)
            .expect(reconfigure)
            .reply(second);

        let mut dev = device(script, cfg);
        firehose_configure(&mut dev, false).unwrap();
        firehose_read(&mut dev, firehose_parser_configure_response).unwrap();
        assert_eq!(dev.fh_cfg.send_buffer_size, 1024 * 1024);
    }

    #[test]
    fn storage_info_parses_geometry_from_json_logs() {
        let reply = br#"<?xml version="1.0" encoding="UTF-8" ?><data><log value="INFO: {&quot;storage_info&quot;: {&quot;total_blocks&quot;: 30535680, &quot;block_size&quot;: 4096}}"/><response value="ACK"/></data>"#.to_vec();

        let script = ScriptedTransport::new()
            .expect(
                firehose_xml_setup(
                    "getstorageinfo",
                    &[("physical_partition_number", "0"), ("print_json", "1")],
                )
                .unwrap(),
            )
            .reply(reply);

        let mut dev = device(script, small_cfg());
        let info = firehose_get_storage_info(&mut dev, 0).unwrap();
        assert_eq!(info.total_sectors, Some(30535680));
        assert_eq!(info.sector_size, Some(4096));
    }

    #[test]
    fn digest_mismatch_is_detected() {
        let wrong = "ab".repeat(32);
        let reply = format!(
            r#"<?xml version="1.0" encoding="UTF-8" ?><data><log value="SHA256 {wrong}"/><response value="ACK"/></data>"#
        );

        let cmd = firehose_xml_setup(
            "getsha256digest",
            &[
                ("SECTOR_SIZE_IN_BYTES", "512"),
                ("num_partition_sectors", "1"),
                ("physical_partition_number", "0"),
                ("start_sector", "0"),
            ],
        )
        .unwrap();

        let script = ScriptedTransport::new()
            .expect(cmd)
            .reply(reply.into_bytes());

        let mut dev = device(script, small_cfg());
        let err = firehose_verify_digest(&mut dev, &[0u8; 32], 1, 0, "0").unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::DataPhaseMismatch { .. })
        ));
    }

    #[test]
    fn reset_modes_use_the_wire_names() {
        for (mode, wire) in [
            (FirehoseResetMode::System, "reset"),
            (FirehoseResetMode::Off, "off"),
            (FirehoseResetMode::ResetToEdl, "reset_to_edl"),
        ] {
            let script = ScriptedTransport::new()
                .expect(
                    firehose_xml_setup("power", &[("value", wire), ("DelayInSeconds", "0")])
                        .unwrap(),
                )
                .reply(ack());
            let mut dev = device(script, small_cfg());
            firehose_reset(&mut dev, mode, 0).unwrap();
        }
    }

    #[test]
    fn drain_logs_consumes_the_welcome_banner() {
        let banner = br#"<?xml version="1.0" encoding="UTF-8" ?><data><log value="Binary build date: ..."/></data>"#.to_vec();
        let script = ScriptedTransport::new().reply(banner);
        let mut dev = device(script, small_cfg());
        let logs = firehose_drain_logs(&mut dev).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].starts_with("Binary build date"));
    }

    #[test]
    fn ack_nak_parser_flags_garbage() {
        let mut dev = device(ScriptedTransport::new(), small_cfg());
        let mut attrs = IndexMap::new();
        attrs.insert("value".to_owned(), "MAYBE".to_owned());
        assert!(firehose_parser_ack_nak(&mut dev, &attrs).is_err());
    }
}
