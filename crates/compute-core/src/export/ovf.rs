//! OVF 1.0 descriptor for OVA packages.

use std::collections::HashMap;

const BYTES_PER_MB: u64 = 1024 * 1024;
const DEFAULT_CPU_COUNT: u32 = 1;
const DEFAULT_MEMORY_MB: u64 = 1024;

#[derive(Debug, Clone)]
pub struct OvfDescriptor {
    pub vm_name: String,
    pub vm_id: String,
    pub file_id: String,
    pub disk_file: String,
    pub disk_size_bytes: u64,
    pub cpu_count: u32,
    pub memory_mb: u64,
}

impl OvfDescriptor {
    /// Build from converter options; `vm_name` is required by the caller,
    /// the rest fall back to defaults.
    pub fn from_options(
        options: &HashMap<String, String>,
        disk_file: impl Into<String>,
        disk_size_bytes: u64,
    ) -> Self {
        let get = |key: &str| options.get(key).map(String::as_str).filter(|v| !v.is_empty());
        Self {
            vm_name: get("vm_name").unwrap_or("vm").to_string(),
            vm_id: get("vm_uuid")
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            file_id: uuid::Uuid::new_v4().to_string(),
            disk_file: disk_file.into(),
            disk_size_bytes,
            cpu_count: get("cpu_count")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CPU_COUNT),
            memory_mb: get("memory_mb")
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MEMORY_MB),
        }
    }

    pub fn disk_size_mb(&self) -> u64 {
        self.disk_size_bytes.div_ceil(BYTES_PER_MB)
    }

    pub fn render(&self) -> String {
        let name = escape(&self.vm_name);
        let file = escape(&self.disk_file);
        let file_id = escape(&self.file_id);
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<Envelope xmlns="http://schemas.dmtf.org/ovf/envelope/1" xmlns:ovf="http://schemas.dmtf.org/ovf/envelope/1" xmlns:rasd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_ResourceAllocationSettingData" xmlns:vssd="http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/CIM_VirtualSystemSettingData" xmlns:vmw="http://www.vmware.com/schema/ovf" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <References>
    <File ovf:href="{file}" ovf:id="{file_id}" ovf:size="{size}"/>
  </References>
  <DiskSection>
    <Info>Virtual disk information</Info>
    <Disk ovf:capacity="{size_mb}" ovf:capacityAllocationUnits="byte * 2^20" ovf:diskId="vmdisk1" ovf:fileRef="{file_id}" ovf:format="http://www.vmware.com/interfaces/specifications/vmdk.html#streamOptimized"/>
  </DiskSection>
  <NetworkSection>
    <Info>The list of logical networks</Info>
    <Network ovf:name="VM Network">
      <Description>The VM Network network</Description>
    </Network>
  </NetworkSection>
  <VirtualSystem ovf:id="{vm_id}">
    <Info>A virtual machine</Info>
    <Name>{name}</Name>
    <OperatingSystemSection ovf:id="101" vmw:osType="otherLinux64Guest">
      <Info>The kind of installed guest operating system</Info>
    </OperatingSystemSection>
    <VirtualHardwareSection>
      <Info>Virtual hardware requirements</Info>
      <System>
        <vssd:ElementName>Virtual Hardware Family</vssd:ElementName>
        <vssd:InstanceID>0</vssd:InstanceID>
        <vssd:VirtualSystemIdentifier>{name}</vssd:VirtualSystemIdentifier>
        <vssd:VirtualSystemType>vmx-10</vssd:VirtualSystemType>
      </System>
      <Item>
        <rasd:AllocationUnits>hertz * 10^6</rasd:AllocationUnits>
        <rasd:Description>Number of Virtual CPUs</rasd:Description>
        <rasd:ElementName>{cpus} virtual CPU(s)</rasd:ElementName>
        <rasd:InstanceID>1</rasd:InstanceID>
        <rasd:ResourceType>3</rasd:ResourceType>
        <rasd:VirtualQuantity>{cpus}</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:AllocationUnits>byte * 2^20</rasd:AllocationUnits>
        <rasd:Description>Memory Size</rasd:Description>
        <rasd:ElementName>{memory}MB of memory</rasd:ElementName>
        <rasd:InstanceID>2</rasd:InstanceID>
        <rasd:ResourceType>4</rasd:ResourceType>
        <rasd:VirtualQuantity>{memory}</rasd:VirtualQuantity>
      </Item>
      <Item>
        <rasd:Address>0</rasd:Address>
        <rasd:Description>SCSI Controller</rasd:Description>
        <rasd:ElementName>SCSI controller 0</rasd:ElementName>
        <rasd:InstanceID>3</rasd:InstanceID>
        <rasd:ResourceSubType>lsilogic</rasd:ResourceSubType>
        <rasd:ResourceType>6</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:AddressOnParent>0</rasd:AddressOnParent>
        <rasd:ElementName>Hard disk 1</rasd:ElementName>
        <rasd:HostResource>ovf:/disk/vmdisk1</rasd:HostResource>
        <rasd:InstanceID>4</rasd:InstanceID>
        <rasd:Parent>3</rasd:Parent>
        <rasd:ResourceType>17</rasd:ResourceType>
      </Item>
      <Item>
        <rasd:AddressOnParent>7</rasd:AddressOnParent>
        <rasd:AutomaticAllocation>true</rasd:AutomaticAllocation>
        <rasd:Connection>VM Network</rasd:Connection>
        <rasd:Description>E1000 ethernet adapter on "VM Network"</rasd:Description>
        <rasd:ElementName>Network adapter 1</rasd:ElementName>
        <rasd:InstanceID>5</rasd:InstanceID>
        <rasd:ResourceSubType>E1000</rasd:ResourceSubType>
        <rasd:ResourceType>10</rasd:ResourceType>
      </Item>
    </VirtualHardwareSection>
  </VirtualSystem>
</Envelope>
"#,
            size = self.disk_size_bytes,
            size_mb = self.disk_size_mb(),
            vm_id = escape(&self.vm_id),
            cpus = self.cpu_count,
            memory = self.memory_mb,
        )
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_defaults() {
        let mut options = HashMap::new();
        options.insert("vm_name".to_string(), "web".to_string());
        let ovf = OvfDescriptor::from_options(&options, "disk.vmdk", 1);
        assert_eq!(ovf.cpu_count, 1);
        assert_eq!(ovf.memory_mb, 1024);
        // Partial megabytes round up.
        assert_eq!(ovf.disk_size_mb(), 1);
    }

    #[test]
    fn test_render_carries_hardware() {
        let mut options = HashMap::new();
        options.insert("vm_name".to_string(), "db & cache".to_string());
        options.insert("vm_uuid".to_string(), "1234".to_string());
        options.insert("cpu_count".to_string(), "4".to_string());
        options.insert("memory_mb".to_string(), "2048".to_string());
        let xml = OvfDescriptor::from_options(&options, "disk.vmdk", 3 * BYTES_PER_MB).render();

        assert!(xml.contains("<Name>db &amp; cache</Name>"));
        assert!(xml.contains(r#"ovf:id="1234""#));
        assert!(xml.contains("<rasd:VirtualQuantity>4</rasd:VirtualQuantity>"));
        assert!(xml.contains("<rasd:VirtualQuantity>2048</rasd:VirtualQuantity>"));
        assert!(xml.contains(r#"ovf:capacity="3""#));
        assert!(xml.contains("vmx-10"));
        assert!(xml.contains("otherLinux64Guest"));
        assert!(xml.contains("<rasd:ResourceSubType>lsilogic</rasd:ResourceSubType>"));
        assert!(xml.contains("<rasd:ResourceSubType>E1000</rasd:ResourceSubType>"));
    }
}
