// SPDX-FileCopyrightText: 2025 2025 Contributors to the OpenIMP project.
// SPDX-License-Identifier: Apache-2.0

//! Smoke tests for the ABI structures.

use bytemuck::Zeroable;

/// Verifies that a buffer-count request round-trips through its byte form
/// the way a driver would see it.
#[test]
fn buf_count_request_is_plain_bytes() {
    let request = imp_sys::FsBufCount::capture(4);
    let bytes = bytemuck::bytes_of(&request);
    assert_eq!(bytes.len(), 12);
    assert_eq!(&bytes[0..4], &4i32.to_ne_bytes());
    assert_eq!(&bytes[4..8], &imp_sys::FS_BUF_TYPE_CAPTURE.to_ne_bytes());

    let decoded: imp_sys::FsBufCount = bytemuck::pod_read_unaligned(bytes);
    assert_eq!(decoded, request);
}

/// Verifies name and tag handling in the DMA descriptor.
#[test]
fn dma_descriptor_strings_are_nul_terminated() {
    let mut info = imp_sys::DmaBufferInfo::zeroed();
    imp_sys::write_c_str(&mut info.name, "vbm_chn0");
    let long_tag = "t".repeat(64);
    let copied = imp_sys::write_c_str(&mut info.tag, &long_tag);

    assert_eq!(info.name(), "vbm_chn0");
    assert_eq!(copied, 31);
    assert_eq!(info.tag().len(), 31);
    assert_eq!(info.tag[31], 0);
}

#[test]
fn version_buffer_reads_back() {
    let mut version = imp_sys::Version::zeroed();
    imp_sys::write_c_str(
        &mut version.version,
        &format!("IMP-{}", imp_sys::IMP_VERSION),
    );
    println!("version: {}", version.as_str());
    assert_eq!(version.as_str(), "IMP-1.1.6");
}
