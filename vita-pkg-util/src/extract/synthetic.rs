//! Files written after the items that have no counterpart in the package.

use super::{ExtractError, License, Output};
use tracing::debug;
use vita_pkg::Pkg;
use vita_pkg::kind::{LicenseTarget, PackageKind};
use vita_sink::OutputSink;

const STAT_SIZE: usize = 768;
const PM_DAT_SIZE: usize = 65536;

pub(super) fn write<R, S>(
    pkg: &Pkg<R>,
    license: Option<&License>,
    root: &str,
    out: &mut Output<'_, S>,
) -> Result<(), ExtractError>
where
    R: AsRef<[u8]>,
    S: OutputSink + ?Sized,
{
    let kind = pkg.info().kind();

    if kind.has_package_files() {
        let package = format!("{root}/sce_sys/package");
        out.parents(&format!("{package}/head.bin"))?;

        let raw = pkg.raw();
        for (file, range) in [("head.bin", pkg.head_range()), ("tail.bin", pkg.tail_range())] {
            let data = &raw[range.start as usize..range.end as usize];
            out.copy(&format!("{package}/{file}"), data, file)?;
        }
        out.file(&format!("{package}/stat.bin"), &[0; STAT_SIZE])?;
        debug!(root, "wrote package files");
    }

    if let (Some(license), Some(layout)) = (license, kind.license_layout()) {
        let path = match layout.target {
            LicenseTarget::WorkBin => format!("{root}/sce_sys/package/work.bin"),
            LicenseTarget::FakeRif => format!("{root}/RO/License/FAKE.rif"),
            LicenseTarget::PspLicense => {
                format!("pspemu/PSP/LICENSE/{}.rif", pkg.info().content_id())
            }
        };
        out.parents(&path)?;
        out.file(&path, license.as_bytes())?;
        debug!(path, "wrote license");
    }

    if kind == PackageKind::VitaPsm {
        for folder in ["RW", "RW/Documents", "RW/Temp", "RW/System"] {
            out.folder(&format!("{root}/{folder}"))?;
        }
        out.file(
            &format!("{root}/RW/System/content_id"),
            pkg.header().content_id_bytes(),
        )?;
        out.file(&format!("{root}/RW/System/pm.dat"), &vec![0; PM_DAT_SIZE])?;
    }

    Ok(())
}
