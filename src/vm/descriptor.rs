// src/vm/descriptor.rs

use std::path::{Path, PathBuf};
use roxmltree::{Document, Node};
use thiserror::Error;
use uuid::Uuid;

/// Namespace of the metadata nova embeds in domain XML
const NOVA_NS: &str = "http://openstack.org/xmlns/libvirt/nova/1.0";

const GIB: u64 = 1024 * 1024 * 1024;

/// Everything a lifecycle call needs to know about one VM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmDescriptor {
    /// Instance UUID
    pub instance_uuid: String,

    /// Instance disk on the host
    pub instance_path: PathBuf,

    /// Base image UUID
    pub image_uuid: String,

    /// Base image path, when the caller knows it
    pub image_path: Option<PathBuf>,

    /// Root disk size from the flavor (0 when unknown)
    pub disk_size_bytes: u64,
}

impl VmDescriptor {
    /// Directory holding the instance disk
    pub fn instance_dir(&self) -> &Path {
        self.instance_path.parent().unwrap_or_else(|| Path::new("/"))
    }
}

/// Extracts a `VmDescriptor` from a hypervisor domain definition
pub trait DomainParser: Send + Sync {
    /// Parses `xml`
    fn parse(&self, xml: &str) -> Result<VmDescriptor, DescriptorError>;
}

/// Parser for libvirt domain XML carrying nova metadata
#[derive(Debug, Default, Clone)]
pub struct LibvirtDomainParser;

impl LibvirtDomainParser {
    /// Creates a parser
    pub fn new() -> Self {
        Self
    }
}

impl DomainParser for LibvirtDomainParser {
    fn parse(&self, xml: &str) -> Result<VmDescriptor, DescriptorError> {
        let document = Document::parse(xml).map_err(|e| DescriptorError::Xml(e.to_string()))?;
        let domain = document.root_element();
        if !domain.has_tag_name("domain") {
            return Err(DescriptorError::Xml(format!(
                "Expected <domain> root element, found <{}>",
                domain.tag_name().name()
            )));
        }

        let instance_uuid = child(domain, "uuid")
            .and_then(|node| node.text())
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or(DescriptorError::Missing("domain uuid"))?;
        let instance_uuid = normalize_uuid(instance_uuid)?;

        let disk = domain
            .descendants()
            .find(|node| {
                node.has_tag_name("disk") && node.attribute("type") == Some("file") && node.attribute("device") == Some("disk")
            })
            .ok_or(DescriptorError::Missing("file backed disk"))?;

        let instance_path = child(disk, "source")
            .and_then(|node| node.attribute("file"))
            .map(PathBuf::from)
            .ok_or(DescriptorError::Missing("disk source file"))?;

        // Live definitions list the base image as the disk's backing store
        let image_path = child(disk, "backingStore")
            .filter(|node| node.attribute("type") == Some("file"))
            .and_then(|node| child(node, "source"))
            .and_then(|node| node.attribute("file"))
            .map(PathBuf::from);

        let image_uuid = domain
            .descendants()
            .find(|node| is_nova(node, "root"))
            .and_then(|node| node.attribute("uuid"))
            .ok_or(DescriptorError::Missing("nova:root uuid"))?;
        let image_uuid = normalize_uuid(image_uuid)?;

        let disk_size_bytes = match domain
            .descendants()
            .find(|node| is_nova(node, "flavor"))
            .and_then(|flavor| flavor.children().find(|node| is_nova(node, "disk")))
            .and_then(|node| node.text())
        {
            Some(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|e| DescriptorError::Invalid(format!("nova:disk {:?}: {}", text, e)))?
                .saturating_mul(GIB),
            None => 0,
        };

        Ok(VmDescriptor {
            instance_uuid,
            instance_path,
            image_uuid,
            image_path,
            disk_size_bytes,
        })
    }
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|child| child.is_element() && child.tag_name().name() == name)
}

fn is_nova(node: &Node<'_, '_>, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name && node.tag_name().namespace() == Some(NOVA_NS)
}

fn normalize_uuid(value: &str) -> Result<String, DescriptorError> {
    Uuid::parse_str(value.trim())
        .map(|uuid| uuid.hyphenated().to_string())
        .map_err(|e| DescriptorError::Invalid(format!("{:?} is not a UUID: {}", value, e)))
}

/// Descriptor extraction errors
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("Malformed domain XML: {0}")]
    Xml(String),

    #[error("Domain XML is missing {0}")]
    Missing(&'static str),

    #[error("Invalid domain XML value: {0}")]
    Invalid(String),
}
