//! Container format detection
//!
//! Each probe is a pure function of the image and an offset. [`detect`]
//! runs them in priority order; container probes unwrap to a new offset and
//! detection restarts there until an ELF image is reached.

use crate::crypto::Decryptor;
use crate::elf::ELF_MAGIC;
use crate::image::RawImage;
use crate::module::ModuleFormat;
use crate::pbp::Pbp;
use crate::psf::{Psf, PSF_MAGIC};
use ag_core::error::LoaderError;
use std::borrow::Cow;
use tracing::{debug, info, warn};

/// `"\0PSP"` as a little-endian word
pub const PSP_EDAT_MAGIC: u32 = 0x5053_5000;
/// `"EDAT"` following [`PSP_EDAT_MAGIC`]
pub const EDAT_MAGIC: u32 = 0x5441_4445;
/// `"~SCE"`
pub const SCE_MAGIC: u32 = 0x4543_537E;
/// `"~PSP"`
pub const PSP_MAGIC: u32 = 0x5053_507E;

/// Start of the `~PSP` image inside an EDAT wrapper
pub const EDAT_PAYLOAD_OFFSET: usize = 0x90;

/// Offset of the ISO9660 primary volume descriptor
const ISO_PVD_OFFSET: usize = 16 * 2048;

/// Unwrapping depth before detection gives up
const MAX_UNWRAP_DEPTH: usize = 4;

/// What probes may use besides the image bytes
pub struct ProbeEnv<'e> {
    pub decryptor: &'e dyn Decryptor,
    /// Whether `~PSP` images may be handed to the decryptor
    pub allow_decrypt: bool,
}

/// Outcome of a matching probe
#[derive(Debug)]
pub enum Probe<'a> {
    /// Container recognized; continue detection at `offset`
    Unwrap {
        format: ModuleFormat,
        offset: usize,
        psf: Option<Psf>,
    },
    /// A raw ELF image was reached
    Elf {
        format: ModuleFormat,
        data: Cow<'a, [u8]>,
    },
    /// Recognized, but cannot be loaded; detection stops
    Unsupported {
        format: ModuleFormat,
        error: LoaderError,
    },
    /// Recognized, but this attempt failed; the next format is tried
    Rejected {
        format: ModuleFormat,
        error: LoaderError,
    },
}

pub type ProbeFn = for<'a> fn(&ProbeEnv<'_>, &'a [u8], usize) -> Option<Probe<'a>>;

/// Probes in priority order
pub const PROBES: [(&str, ProbeFn); 5] = [
    ("PBP", probe_pbp),
    ("EDAT", probe_edat),
    ("~SCE", probe_sce),
    ("~PSP", probe_psp),
    ("ELF", probe_elf),
];

/// Result of running the detector over an image
#[derive(Debug)]
pub struct Detection<'a> {
    /// Every container layer seen on the way
    pub format: ModuleFormat,
    pub psf: Option<Psf>,
    /// The ELF region, or why none was found
    pub elf: Result<Cow<'a, [u8]>, LoaderError>,
}

pub fn probe_pbp<'a>(_env: &ProbeEnv<'_>, data: &'a [u8], offset: usize) -> Option<Probe<'a>> {
    // PBPs are never nested
    if offset != 0 {
        return None;
    }
    let image = RawImage::new(data);
    let pbp = Pbp::parse(&image, offset)?;
    debug!("{}", pbp);
    let psf = pbp.read_psf(&image, offset);
    Some(Probe::Unwrap {
        format: ModuleFormat::PBP,
        offset: offset + pbp.payload_offset() as usize,
        psf,
    })
}

pub fn probe_edat<'a>(_env: &ProbeEnv<'_>, data: &'a [u8], offset: usize) -> Option<Probe<'a>> {
    let image = RawImage::new(data);
    if image.read_u32(offset)? != PSP_EDAT_MAGIC || image.read_u32(offset + 4)? != EDAT_MAGIC {
        return None;
    }
    warn!("Encrypted file detected! (.PSPEDAT)");
    Some(Probe::Unwrap {
        format: ModuleFormat::empty(),
        offset: offset + EDAT_PAYLOAD_OFFSET,
        psf: None,
    })
}

pub fn probe_sce<'a>(_env: &ProbeEnv<'_>, data: &'a [u8], offset: usize) -> Option<Probe<'a>> {
    if RawImage::new(data).read_u32(offset)? != SCE_MAGIC {
        return None;
    }
    warn!("Encrypted file not supported! (~SCE)");
    Some(Probe::Unsupported {
        format: ModuleFormat::SCE,
        error: LoaderError::UnsupportedEncryption("~SCE".to_string()),
    })
}

pub fn probe_psp<'a>(env: &ProbeEnv<'_>, data: &'a [u8], offset: usize) -> Option<Probe<'a>> {
    if RawImage::new(data).read_u32(offset)? != PSP_MAGIC {
        return None;
    }
    warn!("Encrypted file detected! (~PSP)");

    if !env.allow_decrypt {
        return Some(Probe::Unsupported {
            format: ModuleFormat::PSP,
            error: LoaderError::UnsupportedEncryption(
                "~PSP images are only decrypted for the first module".to_string(),
            ),
        });
    }

    info!("Calling crypto engine for PRX");
    match env.decryptor.decrypt(&data[offset..]) {
        Ok(plain) => Some(Probe::Elf {
            format: ModuleFormat::PSP,
            data: Cow::Owned(plain),
        }),
        Err(error) => {
            warn!("~PSP decryption failed: {}", error);
            Some(Probe::Rejected {
                format: ModuleFormat::PSP,
                error,
            })
        }
    }
}

pub fn probe_elf<'a>(_env: &ProbeEnv<'_>, data: &'a [u8], offset: usize) -> Option<Probe<'a>> {
    if RawImage::new(data).read_u32(offset)? != ELF_MAGIC {
        return None;
    }
    Some(Probe::Elf {
        format: ModuleFormat::ELF,
        data: Cow::Borrowed(&data[offset..]),
    })
}

/// Explain why nothing matched at `offset`
pub fn diagnose_unknown(data: &[u8], offset: usize) -> LoaderError {
    let image = RawImage::new(data);
    let magic = image.magic_bytes(offset);

    if &magic == b"CISO" {
        info!("This is not an executable file! Try loading it as a UMD image");
        return LoaderError::NotExecutable("compressed ISO image (CISO)".to_string());
    }
    if u32::from_le_bytes(magic) == PSF_MAGIC {
        info!("This is not an executable file!");
        return LoaderError::NotExecutable("bare PARAM.SFO".to_string());
    }
    if image.slice(offset + ISO_PVD_OFFSET + 1, 5) == Some(b"CD001".as_slice()) {
        info!("This is not an executable file! Try loading it as a UMD image");
        return LoaderError::NotExecutable("ISO9660 disc image".to_string());
    }

    info!(
        "Unrecognized file format, magic {:02X} {:02X} {:02X} {:02X}",
        magic[0], magic[1], magic[2], magic[3]
    );
    LoaderError::UnrecognizedFormat { magic }
}

/// Run the probes over `data` until an ELF region is found
pub fn detect<'a>(data: &'a [u8], env: &ProbeEnv<'_>) -> Detection<'a> {
    let mut format = ModuleFormat::empty();
    let mut psf = None;
    let mut offset = 0usize;

    if data.is_empty() {
        return Detection {
            format,
            psf,
            elf: Err(LoaderError::Empty),
        };
    }

    for _ in 0..MAX_UNWRAP_DEPTH {
        let mut rejection = None;
        let mut next_offset = None;

        for (name, probe) in PROBES {
            let Some(outcome) = probe(env, data, offset) else {
                continue;
            };
            match outcome {
                Probe::Unwrap {
                    format: f,
                    offset: inner,
                    psf: meta,
                } => {
                    debug!("{} container at 0x{:x}, payload at 0x{:x}", name, offset, inner);
                    format |= f;
                    psf = psf.or(meta);
                    next_offset = Some(inner);
                    break;
                }
                Probe::Elf { format: f, data: elf } => {
                    format |= f;
                    return Detection {
                        format,
                        psf,
                        elf: Ok(elf),
                    };
                }
                Probe::Unsupported { format: f, error } => {
                    format |= f;
                    return Detection {
                        format,
                        psf,
                        elf: Err(error),
                    };
                }
                Probe::Rejected { format: f, error } => {
                    debug!("{} probe rejected image at 0x{:x}: {}", name, offset, error);
                    format |= f;
                    rejection = Some(error);
                }
            }
        }

        match next_offset {
            Some(inner) if inner >= data.len() => {
                return Detection {
                    format,
                    psf,
                    elf: Err(LoaderError::NotExecutable("container has no executable payload".to_string())),
                };
            }
            Some(inner) => offset = inner,
            None => {
                let error = rejection.unwrap_or_else(|| diagnose_unknown(data, offset));
                return Detection {
                    format,
                    psf,
                    elf: Err(error),
                };
            }
        }
    }

    Detection {
        format,
        psf,
        elf: Err(LoaderError::NotExecutable("containers nested too deeply".to_string())),
    }
}
