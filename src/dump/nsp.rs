//! NSP build pipeline.
//!
//! Produces one PFS0 archive from a title's NCAs, applying any requested
//! in-flight mutations: distribution-type rewrite, titlekey-crypto
//! removal, NACP policy patches, ticket personalisation stripping. Hashes
//! are recomputed while each NCA streams; a mutated NCA gets a new content
//! ID (the first 16 bytes of its emitted hash), the CNMT is rewritten to
//! match through a hash-layer patch on the meta NCA, and the partition
//! header is back-patched once every payload has been written.
//!
//! Entry order: content NCAs in CNMT order, the meta NCA last among NCAs,
//! then (optionally) the authoring-tool XMLs and icons, then the ticket
//! and certificate chain.

use sha2::{Digest, Sha256};
use std::io::{Read, Seek};

use crate::dump::sink::Sink;
use crate::dump::stream::{StreamSession, TRANSFER_BLOCK_SIZE, run_transfer};
use crate::error::Error;
use crate::formats::cnmt::{Cnmt, CnmtXmlContent, PackagedContentType};
use crate::formats::nacp::{Nacp, NacpPatchOptions, NACP_ROMFS_PATH};
use crate::formats::nca::{Nca, NcaFsSectionType};
use crate::formats::pfs0::Pfs0Builder;
use crate::formats::tik::{Ticket, synthesize_certificate_chain};
use crate::keys::{KeyOracle, Keyset};
use crate::util::nca_file_name;

#[derive(Debug, Clone, Copy)]
pub struct NspBuildOptions {
    /// Rewrite every eligible NCA's distribution type to Download.
    pub set_download_distribution: bool,
    /// Strip titlekey crypto: rights IDs cleared, titlekeys folded into
    /// the key area, no ticket emitted.
    pub remove_titlekey_crypto: bool,
    /// Strip personalisation from the ticket before embedding it.
    pub remove_console_data: bool,
    /// NACP policy rewrites applied to Control NCAs.
    pub nacp_patches: NacpPatchOptions,
    /// Emit authoring-tool XMLs and icons alongside the NCAs.
    pub generate_authoring_tool_xml: bool,
    /// Streaming chunk size.
    pub block_size: usize,
}

impl Default for NspBuildOptions {
    fn default() -> Self {
        Self {
            set_download_distribution: false,
            remove_titlekey_crypto: false,
            remove_console_data: false,
            nacp_patches: NacpPatchOptions::default(),
            generate_authoring_tool_xml: false,
            block_size: TRANSFER_BLOCK_SIZE,
        }
    }
}

/// Final identity of one emitted content.
#[derive(Debug, Clone)]
pub struct EmittedContent {
    pub content_type: PackagedContentType,
    pub content_id: [u8; 0x10],
    pub id_offset: u8,
    pub size: u64,
    pub hash: [u8; 0x20],
}

#[derive(Debug)]
pub struct NspBuildReport {
    pub total_size: u64,
    pub entries: Vec<(String, u64)>,
    pub contents: Vec<EmittedContent>,
}

enum EntryKind {
    /// `content_ncas[index]`, same index as the CNMT content record.
    Content { index: usize },
    Meta,
    /// Regenerated after streaming, when content IDs are final.
    CnmtXml,
    Blob { data: Vec<u8> },
}

/// Which content an auxiliary entry's file name is derived from.
#[derive(Debug, Clone, Copy)]
enum EntryOwner {
    Content(usize),
    Meta,
}

struct PlannedEntry {
    name: String,
    size: u64,
    kind: EntryKind,
    /// Set on auxiliary entries whose name starts with a content ID; they
    /// are renamed once that content's emitted identity is final.
    owner: Option<EntryOwner>,
}

pub struct NspBuilder<'k, R: Read + Seek> {
    keyset: &'k Keyset,
    oracle: Option<&'k dyn KeyOracle>,
    meta_nca: Nca<R>,
    content_ncas: Vec<Nca<R>>,
    cnmt: Cnmt,
    ticket: Option<Ticket>,
    cert_chain: Option<Vec<u8>>,
    options: NspBuildOptions,
    entries: Vec<PlannedEntry>,
    pfs: Pfs0Builder,
    cnmt_dirty: bool,
    prepared: bool,
}

impl<'k, R: Read + Seek> NspBuilder<'k, R> {
    /// Creates a builder for one title. `content_ncas` must follow the
    /// CNMT's content record order; `meta_content_id` is the meta NCA's
    /// registered content ID.
    pub fn new(
        keyset: &'k Keyset,
        mut meta_nca: Nca<R>,
        meta_content_id: [u8; 0x10],
        mut content_ncas: Vec<Nca<R>>,
        ticket: Option<Ticket>,
        cert_chain: Option<Vec<u8>>,
        options: NspBuildOptions,
    ) -> Result<Self, Error> {
        let cnmt = Cnmt::from_meta_nca(&meta_nca)?;

        if cnmt.content_entries.len() != content_ncas.len() {
            return Err(Error::InvalidCnmt(format!(
                "CNMT lists {} contents, {} NCAs supplied",
                cnmt.content_entries.len(),
                content_ncas.len()
            )));
        }

        for (record, nca) in cnmt.content_entries.iter().zip(content_ncas.iter_mut()) {
            nca.set_content_info(record.info.content_id, record.info.id_offset);
            if record.info.size != nca.content_size {
                return Err(Error::InvalidCnmt(format!(
                    "content {} declares {:#x} bytes but the NCA is {:#x}",
                    hex::encode(record.info.content_id),
                    record.info.size,
                    nca.content_size
                )));
            }
        }
        meta_nca.set_content_info(meta_content_id, 0);

        if let Some(ticket) = &ticket {
            if !ticket.is_valid() {
                return Err(Error::InvalidTicket("supplied ticket is not usable".into()));
            }
        }

        Ok(Self {
            keyset,
            oracle: None,
            meta_nca,
            content_ncas,
            cnmt,
            ticket,
            cert_chain,
            options,
            entries: Vec::new(),
            pfs: Pfs0Builder::new(),
            cnmt_dirty: false,
            prepared: false,
        })
    }

    /// Supplies the key oracle used for ticket personalisation stripping.
    pub fn with_oracle(mut self, oracle: &'k dyn KeyOracle) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn cnmt(&self) -> &Cnmt {
        &self.cnmt
    }

    fn content_type(&self, index: usize) -> PackagedContentType {
        self.cnmt.content_entries[index].info.content_type
    }

    /// Whether a content NCA may be mutated at all.
    fn mutable(&self, index: usize) -> bool {
        let nca = &self.content_ncas[index];
        if self.content_type(index) == PackagedContentType::DeltaFragment {
            return false;
        }
        if nca.has_rights_id() && nca.titlekey().is_none() {
            // Body cannot be decrypted; leave the NCA untouched.
            return false;
        }
        true
    }

    /// Applies requested mutations and computes the output layout.
    pub fn prepare(&mut self) -> Result<(), Error> {
        if self.prepared {
            return Ok(());
        }

        for nca in &self.content_ncas {
            if nca.has_rights_id() && nca.titlekey().is_none() {
                tracing::warn!(
                    content_id = %hex::encode(nca.content_id),
                    "titlekey unavailable; content will be copied untouched"
                );
            }
        }

        // Per-NCA mutations.
        for index in 0..self.content_ncas.len() {
            if !self.mutable(index) {
                continue;
            }

            if self.options.set_download_distribution {
                self.content_ncas[index].set_distribution_type_download();
            }
            if self.options.remove_titlekey_crypto && self.content_ncas[index].has_rights_id() {
                self.content_ncas[index].remove_titlekey_crypto(self.keyset)?;
            }
            if self.options.nacp_patches.any()
                && self.content_type(index) == PackagedContentType::Control
            {
                self.apply_nacp_patches(index)?;
            }
        }
        if self.options.set_download_distribution {
            self.meta_nca.set_distribution_type_download();
        }

        // Ticket handling.
        if self.options.remove_titlekey_crypto {
            self.ticket = None;
            self.cert_chain = None;
        } else if let Some(ticket) = self.ticket.as_mut() {
            if self.options.remove_console_data && ticket.is_personalized() {
                let oracle = self.oracle.ok_or_else(|| {
                    Error::MissingKey("key oracle required to strip personalisation".into())
                })?;
                self.cert_chain = Some(ticket.convert_personalized_to_common(oracle)?);
            } else if self.cert_chain.is_none() {
                self.cert_chain = Some(synthesize_certificate_chain(ticket.issuer_str())?);
            }
        }

        self.plan_layout()?;
        self.prepared = true;
        Ok(())
    }

    fn apply_nacp_patches(&mut self, index: usize) -> Result<(), Error> {
        let (section_idx, file_offset, new_bytes) = {
            let nca = &self.content_ncas[index];
            let section = nca
                .find_section(NcaFsSectionType::RomFs)
                .ok_or_else(|| Error::InvalidNca("Control NCA has no RomFS".into()))?;
            let section_idx = section.section_idx;
            let (data_layer_offset, _) = section.data_layer();

            let mut romfs = nca.open_romfs_filesystem(section_idx)?;
            let entry = romfs.find_file(NACP_ROMFS_PATH)?;
            let blob = romfs.extract_file(NACP_ROMFS_PATH)?;
            let mut nacp = Nacp::from_bytes(&blob)?;

            if !self.options.nacp_patches.apply(&mut nacp) {
                return Ok(());
            }

            let file_offset =
                data_layer_offset + romfs.header.file_data_offset + entry.data_offset;
            (section_idx, file_offset, nacp.to_bytes()?)
        };

        crate::formats::nca::patch::generate_hash_data_patch(
            &mut self.content_ncas[index],
            section_idx,
            file_offset,
            &new_bytes,
        )
    }

    /// Reads the (possibly patched) control data for a Control NCA: the
    /// NACP plus every icon, as they will appear in the emitted NCA.
    fn control_payload(&self, index: usize) -> Result<(Nacp, Vec<(String, Vec<u8>)>), Error> {
        let nca = &self.content_ncas[index];
        let section = nca
            .find_section(NcaFsSectionType::RomFs)
            .ok_or_else(|| Error::InvalidNca("Control NCA has no RomFS".into()))?;
        let mut romfs = nca.open_romfs_filesystem(section.section_idx)?;

        let blob = romfs.extract_file(NACP_ROMFS_PATH)?;
        let mut nacp = Nacp::from_bytes(&blob)?;
        // Registered patches are invisible through the plaintext read
        // path; mirror them onto the extracted copy.
        if self.mutable(index) {
            self.options.nacp_patches.apply(&mut nacp);
        }

        let mut icons = Vec::new();
        for (lang, file_name) in nacp.icon_file_names() {
            let path = format!("/{}", file_name);
            if romfs.file_exists(&path) {
                icons.push((lang.as_str().to_string(), romfs.extract_file(&path)?));
            }
        }
        Ok((nacp, icons))
    }

    fn xml_contents(&self) -> Vec<CnmtXmlContent> {
        let mut contents: Vec<CnmtXmlContent> = self
            .cnmt
            .content_entries
            .iter()
            .enumerate()
            .map(|(i, record)| CnmtXmlContent {
                content_type: record.info.content_type,
                content_id: record.info.content_id,
                size: record.info.size,
                hash: record.hash,
                key_generation: self.content_ncas[i].header.get_key_generation(),
                id_offset: record.info.id_offset,
            })
            .collect();
        contents.push(CnmtXmlContent {
            content_type: PackagedContentType::Meta,
            content_id: self.meta_nca.content_id,
            size: self.meta_nca.content_size,
            hash: [0; 0x20],
            key_generation: self.meta_nca.header.get_key_generation(),
            id_offset: 0,
        });
        contents
    }

    fn plan_layout(&mut self) -> Result<(), Error> {
        let mut entries = Vec::new();

        for (index, nca) in self.content_ncas.iter().enumerate() {
            entries.push(PlannedEntry {
                name: nca_file_name(&nca.content_id, false),
                size: nca.content_size,
                kind: EntryKind::Content { index },
                owner: None,
            });
        }
        entries.push(PlannedEntry {
            name: nca_file_name(&self.meta_nca.content_id, true),
            size: self.meta_nca.content_size,
            kind: EntryKind::Meta,
            owner: None,
        });

        if self.options.generate_authoring_tool_xml {
            // Sized from the current identities; the post-stream rewrite
            // only swaps fixed-width IDs and hashes.
            let placeholder = self.cnmt.generate_authoring_tool_xml(&self.xml_contents());
            entries.push(PlannedEntry {
                name: format!("{}.cnmt.xml", hex::encode(self.meta_nca.content_id)),
                size: placeholder.len() as u64,
                kind: EntryKind::CnmtXml,
                owner: Some(EntryOwner::Meta),
            });

            for (index, nca) in self.content_ncas.iter().enumerate() {
                let id_hex = hex::encode(nca.content_id);
                match self.content_type(index) {
                    PackagedContentType::Program => {
                        let xml = program_info_xml(nca);
                        entries.push(PlannedEntry {
                            name: format!("{}.programinfo.xml", id_hex),
                            size: xml.len() as u64,
                            kind: EntryKind::Blob {
                                data: xml.into_bytes(),
                            },
                            owner: Some(EntryOwner::Content(index)),
                        });
                    }
                    PackagedContentType::Control => {
                        let (nacp, icons) = self.control_payload(index)?;
                        for (lang, data) in icons {
                            entries.push(PlannedEntry {
                                name: format!("{}.nx.{}.jpg", id_hex, lang),
                                size: data.len() as u64,
                                kind: EntryKind::Blob { data },
                                owner: Some(EntryOwner::Content(index)),
                            });
                        }
                        let xml = nacp.generate_authoring_tool_xml();
                        entries.push(PlannedEntry {
                            name: format!("{}.nacp.xml", id_hex),
                            size: xml.len() as u64,
                            kind: EntryKind::Blob {
                                data: xml.into_bytes(),
                            },
                            owner: Some(EntryOwner::Content(index)),
                        });
                    }
                    PackagedContentType::LegalInformation => {
                        if let Some(xml) = self.legal_info_payload(index)? {
                            entries.push(PlannedEntry {
                                name: format!("{}.legalinfo.xml", id_hex),
                                size: xml.len() as u64,
                                kind: EntryKind::Blob { data: xml },
                                owner: Some(EntryOwner::Content(index)),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        if let (Some(ticket), Some(chain)) = (&self.ticket, &self.cert_chain) {
            let rights_hex = hex::encode(ticket.common.rights_id);
            let tik_bytes = ticket.to_bytes()?;
            entries.push(PlannedEntry {
                name: format!("{}.tik", rights_hex),
                size: tik_bytes.len() as u64,
                kind: EntryKind::Blob { data: tik_bytes },
                owner: None,
            });
            entries.push(PlannedEntry {
                name: format!("{}.cert", rights_hex),
                size: chain.len() as u64,
                kind: EntryKind::Blob {
                    data: chain.clone(),
                },
                owner: None,
            });
        }

        for entry in &entries {
            self.pfs.add_entry(entry.name.clone(), entry.size);
        }
        self.entries = entries;
        Ok(())
    }

    fn legal_info_payload(&self, index: usize) -> Result<Option<Vec<u8>>, Error> {
        let nca = &self.content_ncas[index];
        let Some(section) = nca.find_section(NcaFsSectionType::RomFs) else {
            return Ok(None);
        };
        let mut romfs = nca.open_romfs_filesystem(section.section_idx)?;
        if !romfs.file_exists("/legalinfo.xml") {
            return Ok(None);
        }
        Ok(Some(romfs.extract_file("/legalinfo.xml")?))
    }

    /// Streams the archive out. On any error the sink is cancelled so no
    /// partial output remains.
    pub fn build(&mut self, sink: &mut dyn Sink, file_name: &str) -> Result<NspBuildReport, Error>
    where
        R: Send,
    {
        self.prepare()?;

        match self.build_inner(sink, file_name) {
            Ok(report) => Ok(report),
            Err(e) => {
                let _ = sink.cancel();
                Err(e)
            }
        }
    }

    fn build_inner(&mut self, sink: &mut dyn Sink, file_name: &str) -> Result<NspBuildReport, Error>
    where
        R: Send,
    {
        let header_size = self.pfs.header_size();
        let total_size = header_size + self.pfs.fs_size();

        sink.begin_file(file_name, total_size, header_size as u32)?;

        let mut emitted: Vec<EmittedContent> = Vec::new();
        let mut auxiliary_renamed = false;

        for entry_index in 0..self.entries.len() {
            // Once every NCA has streamed, auxiliary entry names can pick
            // up the final content IDs (before they are announced).
            if !auxiliary_renamed
                && !matches!(
                    self.entries[entry_index].kind,
                    EntryKind::Content { .. } | EntryKind::Meta
                )
            {
                self.rename_auxiliary_entries(&emitted)?;
                auxiliary_renamed = true;
            }

            let (name, size) = {
                let entry = &self.entries[entry_index];
                (entry.name.clone(), entry.size)
            };
            sink.begin_entry(&name, size)?;

            let mut renamed_entry: Option<String> = None;
            match &self.entries[entry_index].kind {
                EntryKind::Content { index } => {
                    let index = *index;
                    let record = self.cnmt.content_entries[index].clone();
                    let nca = &mut self.content_ncas[index];

                    let (clean, dirty) = stream_nca(nca, sink, self.options.block_size)?;

                    if clean != record.hash {
                        return Err(Error::CorruptNca(format!(
                            "content {} hash mismatch during streaming",
                            hex::encode(record.info.content_id)
                        )));
                    }

                    let mut final_id = record.info.content_id;
                    if dirty != clean {
                        final_id = dirty[..0x10].try_into().unwrap();
                        self.cnmt.update_content_info(
                            record.info.content_type,
                            record.info.id_offset,
                            final_id,
                            record.info.size,
                            dirty,
                        )?;
                        let new_name = nca_file_name(&final_id, false);
                        self.pfs.update_entry_name(entry_index, new_name.clone())?;
                        renamed_entry = Some(new_name);
                        self.cnmt_dirty = true;
                        tracing::trace!(
                            old = %hex::encode(record.info.content_id),
                            new = %hex::encode(final_id),
                            "mutated content renamed"
                        );
                    }

                    emitted.push(EmittedContent {
                        content_type: record.info.content_type,
                        content_id: final_id,
                        id_offset: record.info.id_offset,
                        size: record.info.size,
                        hash: dirty,
                    });
                }
                EntryKind::Meta => {
                    if self.cnmt_dirty {
                        self.cnmt.generate_meta_nca_patch(&mut self.meta_nca)?;
                    }

                    // The meta NCA has no CNMT record of its own, so only
                    // the emitted hash matters.
                    let (clean, dirty) =
                        stream_nca(&mut self.meta_nca, sink, self.options.block_size)?;

                    let mut final_id = self.meta_nca.content_id;
                    if dirty != clean {
                        final_id = dirty[..0x10].try_into().unwrap();
                        let new_name = nca_file_name(&final_id, true);
                        self.pfs.update_entry_name(entry_index, new_name.clone())?;
                        renamed_entry = Some(new_name);
                        self.meta_nca.content_id = final_id;
                    }

                    emitted.push(EmittedContent {
                        content_type: PackagedContentType::Meta,
                        content_id: final_id,
                        id_offset: 0,
                        size: self.meta_nca.content_size,
                        hash: dirty,
                    });
                }
                EntryKind::CnmtXml => {
                    let mut contents = self.xml_contents();
                    // The meta element carries its emitted identity.
                    if let Some(meta) = emitted
                        .iter()
                        .find(|c| c.content_type == PackagedContentType::Meta)
                    {
                        if let Some(last) = contents.last_mut() {
                            last.content_id = meta.content_id;
                            last.hash = meta.hash;
                        }
                    }

                    let xml = self.cnmt.generate_authoring_tool_xml(&contents);
                    if xml.len() as u64 != size {
                        return Err(Error::InvalidState(
                            "authoring XML size drifted between layout and emission".into(),
                        ));
                    }
                    sink.write(xml.as_bytes())?;
                }
                EntryKind::Blob { data } => {
                    sink.write(data)?;
                }
            }

            if let Some(new_name) = renamed_entry {
                self.entries[entry_index].name = new_name;
            }
        }

        let header = self.pfs.write_header()?;
        if header.len() as u64 != header_size {
            return Err(Error::InvalidState(
                "partition header size drifted during build".into(),
            ));
        }
        sink.rewind_and_write_header(&header)?;
        sink.end_file()?;

        tracing::info!(
            file_name,
            total_size,
            size = %crate::util::format_size(total_size),
            "NSP build finished"
        );

        Ok(NspBuildReport {
            total_size,
            entries: self
                .entries
                .iter()
                .map(|e| (e.name.clone(), e.size))
                .collect(),
            contents: emitted,
        })
    }
}

impl<R: Read + Seek> NspBuilder<'_, R> {
    /// Replaces the content-ID prefix of every auxiliary entry name with
    /// the owner's emitted identity.
    fn rename_auxiliary_entries(&mut self, emitted: &[EmittedContent]) -> Result<(), Error> {
        for entry_index in 0..self.entries.len() {
            let Some(owner) = self.entries[entry_index].owner else {
                continue;
            };
            let final_id = match owner {
                EntryOwner::Content(i) => emitted
                    .iter()
                    .filter(|c| c.content_type != PackagedContentType::Meta)
                    .nth(i)
                    .map(|c| c.content_id),
                EntryOwner::Meta => emitted
                    .iter()
                    .find(|c| c.content_type == PackagedContentType::Meta)
                    .map(|c| c.content_id),
            };
            let Some(final_id) = final_id else { continue };

            let suffix = self.entries[entry_index]
                .name
                .split_once('.')
                .map(|(_, suffix)| suffix.to_string())
                .ok_or_else(|| Error::InvalidState("auxiliary entry without suffix".into()))?;
            let new_name = format!("{}.{}", hex::encode(final_id), suffix);
            if new_name != self.entries[entry_index].name {
                self.pfs.update_entry_name(entry_index, new_name.clone())?;
                self.entries[entry_index].name = new_name;
            }
        }
        Ok(())
    }
}

/// Streams one NCA through the producer/consumer pair, applying pending
/// patches in flight. Returns (clean, dirty) SHA-256 over the source and
/// emitted bytes respectively.
fn stream_nca<R: Read + Seek + Send>(
    nca: &mut Nca<R>,
    sink: &mut dyn Sink,
    block_size: usize,
) -> Result<([u8; 0x20], [u8; 0x20]), Error> {
    let mut clean = Sha256::new();
    let mut dirty = Sha256::new();

    let session = StreamSession::with_block_size(nca.content_size, block_size);
    {
        let clean = &mut clean;
        let dirty = &mut dirty;
        let nca = &mut *nca;
        run_transfer(
            &session,
            block_size,
            move |offset, buf| {
                nca.read_content_file(offset, buf)?;
                clean.update(&buf[..]);
                nca.patch_stream_chunk(offset, buf);
                dirty.update(&buf[..]);
                Ok(())
            },
            sink,
        )?;
    }

    Ok((clean.finalize().into(), dirty.finalize().into()))
}

/// Deterministic program-info document derived from the Program NCA's
/// header; the full NPDM walk belongs to the external tooling.
fn program_info_xml<R: Read + Seek>(nca: &Nca<R>) -> String {
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    xml.push_str("<ProgramInfo>\n");
    xml.push_str(&format!(
        "  <SdkVersion>{}_{}_{}</SdkVersion>\n",
        (nca.header.sdk_version >> 24) & 0xFF,
        (nca.header.sdk_version >> 16) & 0xFF,
        (nca.header.sdk_version >> 8) & 0xFF,
    ));
    xml.push_str(&format!(
        "  <ProgramId>0x{:016x}</ProgramId>\n",
        nca.header.program_id
    ));
    xml.push_str("  <BuildTarget>64</BuildTarget>\n");
    xml.push_str("</ProgramInfo>\n");
    xml
}
