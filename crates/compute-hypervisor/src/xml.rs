//! Domain XML rendering for `virsh define`.

use std::fmt::Write;

use crate::client::{DiskSource, DomainSpec};

pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Attribute carrying an interface's source for each interface type.
pub fn source_attribute(kind: &str) -> &'static str {
    match kind {
        "bridge" => "bridge",
        "direct" => "dev",
        _ => "network",
    }
}

pub fn render_domain(spec: &DomainSpec) -> String {
    let mut xml = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&spec.name));
    let _ = writeln!(xml, "  <uuid>{}</uuid>", escape(&spec.uuid));
    let memory_kib = spec.memory_bytes / 1024;
    let _ = writeln!(xml, "  <memory unit='KiB'>{memory_kib}</memory>");
    let _ = writeln!(xml, "  <currentMemory unit='KiB'>{memory_kib}</currentMemory>");
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", spec.vcpus);
    let _ = writeln!(xml, "  <os>");
    let _ = writeln!(xml, "    <type arch='x86_64' machine='pc'>hvm</type>");
    let _ = writeln!(xml, "    <boot dev='hd'/>");
    let _ = writeln!(xml, "  </os>");
    let _ = writeln!(xml, "  <features><acpi/><apic/></features>");
    match spec.topology {
        Some(t) => {
            let _ = writeln!(xml, "  <cpu mode='host-passthrough'>");
            let _ = writeln!(
                xml,
                "    <topology sockets='{}' cores='{}' threads='{}'/>",
                t.sockets, t.cores, t.threads
            );
            let _ = writeln!(xml, "  </cpu>");
        }
        None => {
            let _ = writeln!(xml, "  <cpu mode='host-passthrough'/>");
        }
    }
    let _ = writeln!(xml, "  <on_poweroff>destroy</on_poweroff>");
    let _ = writeln!(xml, "  <on_reboot>restart</on_reboot>");
    let _ = writeln!(xml, "  <on_crash>destroy</on_crash>");
    let _ = writeln!(xml, "  <devices>");

    for disk in &spec.disks {
        let (disk_type, source) = match &disk.source {
            DiskSource::File(path) => ("file", format!("<source file='{}'/>", escape(path))),
            DiskSource::Volume { pool, volume } => (
                "volume",
                format!(
                    "<source pool='{}' volume='{}'/>",
                    escape(pool),
                    escape(volume)
                ),
            ),
        };
        let _ = writeln!(xml, "    <disk type='{disk_type}' device='disk'>");
        let _ = writeln!(
            xml,
            "      <driver name='qemu' type='{}'/>",
            escape(&disk.format)
        );
        let _ = writeln!(xml, "      {source}");
        let _ = writeln!(
            xml,
            "      <target dev='{}' bus='{}'/>",
            escape(&disk.target),
            escape(&disk.bus)
        );
        if disk.read_only {
            let _ = writeln!(xml, "      <readonly/>");
        }
        let _ = writeln!(xml, "    </disk>");
    }

    for iface in &spec.interfaces {
        let _ = writeln!(xml, "    <interface type='{}'>", escape(&iface.kind));
        let _ = writeln!(
            xml,
            "      <source {}='{}'/>",
            source_attribute(&iface.kind),
            escape(&iface.source)
        );
        if !iface.mac_address.is_empty() {
            let _ = writeln!(xml, "      <mac address='{}'/>", escape(&iface.mac_address));
        }
        let _ = writeln!(xml, "      <model type='{}'/>", escape(&iface.model));
        let _ = writeln!(xml, "    </interface>");
    }

    let _ = writeln!(xml, "    <console type='pty'/>");
    let _ = writeln!(xml, "    <graphics type='vnc' port='-1' autoport='yes'/>");
    let _ = writeln!(xml, "  </devices>");
    let _ = writeln!(xml, "</domain>");
    xml
}
