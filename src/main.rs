//! Moves Zarr forecast datasets between S3 and local storage and merges them along the time axis
//!
//! # Installation
//!
//! ```sh
//! cargo install rezarr
//! ```
//!
//! # Command-line Interface
//!
//! ```text
//! Moves Zarr forecast datasets between an S3-compatible object store and the
//! local filesystem, concatenates two local stores along their time axis, and
//! overrides coordinate arrays from a NetCDF coordinate file.
//!
//! Exactly one operation runs per invocation, selected from the source and
//! destination paths: a remote source downloads, a remote destination uploads,
//! two local Zarr paths concatenate, and a local Zarr destination together
//! with --coords overrides coordinates. Argument combinations matching none of
//! these patterns exit successfully without doing anything.
//!
//! Usage: rezarr [OPTIONS] --src <path> --dest <path>
//!
//! Options:
//!       --src <path>
//!           The source path.
//!
//!           A path starting with s3:// addresses the remote object store, for
//!           example s3://bucket-name/path/to/forecast.zarr; anything else is
//!           a path on the local filesystem.
//!
//!       --dest <path>
//!           The destination path, same convention as the source path.
//!
//!       --coords <path>
//!           Overrides latitude/longitude values in the destination Zarr
//!           store with the lat/lon variables of this NetCDF file.
//!
//!       --endpoint <url>
//!           The S3-compatible object store endpoint.
//!
//!           [default: https://lake.fmi.fi]
//!
//!   -h, --help
//!           Print help
//!
//!   -V, --version
//!           Print version
//! ```

#![forbid(unsafe_code)]
#![forbid(missing_docs)]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, crate_version};
use ndarray::{Array1, Axis};
use object_store::ObjectStore;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Runtime;
use zarrs::array::{Array, DataType, Element, ElementOwned};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;
use zarrs::group::Group;
use zarrs::node::{NodePath, node_exists};
use zarrs::storage::storage_adapter::async_to_sync::{
	AsyncToSyncBlockOn, AsyncToSyncStorageAdapter,
};
use zarrs::storage::{
	ListableStorageTraits, ReadableListableStorage, ReadableListableStorageTraits,
	ReadableStorageTraits, ReadableWritableListableStorage,
	ReadableWritableListableStorageTraits, StoreKeys, WritableStorageTraits,
};
use zarrs_object_store::AsyncObjectStore;

/// Moves Zarr forecast datasets between an S3-compatible object store and the
/// local filesystem, concatenates two local stores along their time axis, and
/// overrides coordinate arrays from a NetCDF coordinate file.
///
/// Exactly one operation runs per invocation, selected from the source and
/// destination paths: a remote source downloads, a remote destination uploads,
/// two local Zarr paths concatenate, and a local Zarr destination together with
/// --coords overrides coordinates. Argument combinations matching none of these
/// patterns exit successfully without doing anything.
#[derive(Parser, Debug)]
#[command(version = crate_version!(), arg_required_else_help = true)]
struct Rezarr {
	/// The source path.
	///
	/// A path starting with s3:// addresses the remote object store, for
	/// example s3://bucket-name/path/to/forecast.zarr; anything else is a path
	/// on the local filesystem.
	#[arg(long, value_name = "path")]
	src: String,
	/// The destination path, same convention as the source path.
	#[arg(long, value_name = "path")]
	dest: String,
	/// Overrides latitude/longitude values in the destination Zarr store with
	/// the lat/lon variables of this NetCDF file.
	#[arg(long, value_name = "path")]
	coords: Option<PathBuf>,
	/// The S3-compatible object store endpoint.
	#[arg(long, value_name = "url", default_value = "https://lake.fmi.fi")]
	endpoint: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Operation {
	Download,
	Upload,
	Concat,
	OverrideCoords(PathBuf),
}

fn select_operation(src: &str, dest: &str, coords: Option<&Path>) -> Option<Operation> {
	if src.starts_with("s3://") {
		Some(Operation::Download)
	} else if dest.starts_with("s3://") {
		Some(Operation::Upload)
	} else if src.contains("zarr") && dest.contains("zarr") {
		Some(Operation::Concat)
	} else if let Some(coords) = coords {
		dest.contains("zarr")
			.then(|| Operation::OverrideCoords(coords.to_path_buf()))
	} else {
		None
	}
}

fn main() -> Result<()> {
	let Rezarr {
		src,
		dest,
		coords,
		endpoint,
	} = Rezarr::parse();
	match select_operation(&src, &dest, coords.as_deref()) {
		Some(Operation::Download) => download(&src, Path::new(&dest), &endpoint),
		Some(Operation::Upload) => upload(Path::new(&src), &dest, &endpoint),
		Some(Operation::Concat) => concat(Path::new(&src), Path::new(&dest)),
		Some(Operation::OverrideCoords(coords)) => override_coords(&coords, Path::new(&dest)),
		None => Ok(()),
	}
}

fn split_remote(url: &str) -> Result<(&str, &str)> {
	url.strip_prefix("s3://")
		.and_then(|remainder| remainder.split_once('/'))
		.filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
		.ok_or_else(|| anyhow!("No bucket and key in object store URL {url:?}"))
}

struct TokioBlockOn(tokio::runtime::Handle);

impl AsyncToSyncBlockOn for TokioBlockOn {
	fn block_on<F: core::future::Future>(&self, future: F) -> F::Output {
		self.0.block_on(future)
	}
}

fn s3_client(endpoint: &str, bucket: &str) -> Result<AmazonS3> {
	AmazonS3Builder::from_env()
		.with_bucket_name(bucket)
		.with_endpoint(endpoint)
		.with_allow_http(endpoint.starts_with("http://"))
		.build()
		.with_context(|| format!("Cannot configure object store client for {endpoint:?}"))
}

fn remote_storage(runtime: &Runtime, client: AmazonS3, prefix: &str) -> ReadableListableStorage {
	// The object_store client runs on tokio behind the synchronous storage
	// interface.
	let store = AsyncObjectStore::new(PrefixStore::new(client, prefix));
	let block_on = TokioBlockOn(runtime.handle().clone());
	Arc::new(AsyncToSyncStorageAdapter::new(Arc::new(store), block_on))
}

fn upload(src: &Path, dest: &str, endpoint: &str) -> Result<()> {
	println!("writing new prediction to s3 ({endpoint})");
	let (bucket, key) = split_remote(dest)?;
	let contents = fs::read(src).with_context(|| format!("Cannot open input file {src:?}"))?;
	let runtime = Runtime::new()?;
	let client = s3_client(endpoint, bucket)?;
	put_object(&runtime, &client, key, contents)?;
	println!("{src:?}: written to {dest:?}");
	Ok(())
}

fn put_object(
	runtime: &Runtime,
	store: &dyn ObjectStore,
	key: &str,
	contents: Vec<u8>,
) -> Result<()> {
	runtime
		.block_on(store.put(&ObjectPath::from(key), contents.into()))
		.with_context(|| format!("Cannot write object {key:?}"))?;
	Ok(())
}

fn download(src: &str, dest: &Path, endpoint: &str) -> Result<()> {
	if !src.ends_with("zarr") {
		println!("{src:?}: can only load zarr stores from s3 to the local filesystem");
	}
	let (bucket, key) = split_remote(src)?;
	let runtime = Runtime::new()?;
	let remote = remote_storage(&runtime, s3_client(endpoint, bucket)?, key);
	fetch_store(&remote, src, dest)
}

fn fetch_store(remote: &ReadableListableStorage, src: &str, dest: &Path) -> Result<()> {
	let keys = remote.list().with_context(|| format!("Cannot list {src:?}"))?;
	if keys.is_empty() {
		println!("{src:?}: the zarr store does not exist in the bucket");
		return Ok(());
	}
	// Clear the destination folder, ignoring a folder that is not there yet.
	let _ = fs::remove_dir_all(dest);
	let local = FilesystemStore::new(dest)
		.with_context(|| format!("Cannot create local zarr store {dest:?}"))?;
	copy_store(&keys, remote.as_ref(), &local)
		.with_context(|| format!("Cannot copy {src:?} to {dest:?}"))?;
	println!("{src:?}: downloaded to {dest:?}");
	Ok(())
}

fn copy_store<TSrc, TDst>(keys: &StoreKeys, src: &TSrc, dst: &TDst) -> Result<()>
where
	TSrc: ReadableStorageTraits + ?Sized,
	TDst: WritableStorageTraits + ?Sized,
{
	for key in keys {
		if let Some(value) = src.get(key)? {
			dst.set(key, value)?;
		}
	}
	Ok(())
}

fn concat(first: &Path, second: &Path) -> Result<()> {
	let src: ReadableListableStorage = Arc::new(
		FilesystemStore::new(first).with_context(|| format!("Cannot open zarr store {first:?}"))?,
	);
	let dest: ReadableWritableListableStorage = Arc::new(
		FilesystemStore::new(second)
			.with_context(|| format!("Cannot open zarr store {second:?}"))?,
	);
	for name in ["dates", "data"] {
		let src_array = Array::open(src.clone(), &format!("/{name}"))
			.with_context(|| format!("Cannot open array {name:?} in {first:?}"))?;
		let mut dest_array = Array::open(dest.clone(), &format!("/{name}"))
			.with_context(|| format!("Cannot open array {name:?} in {second:?}"))?;
		let shape = match dest_array.data_type() {
			DataType::Bool => merge_arrays::<bool>(&src_array, &mut dest_array),
			DataType::Int8 => merge_arrays::<i8>(&src_array, &mut dest_array),
			DataType::Int16 => merge_arrays::<i16>(&src_array, &mut dest_array),
			DataType::Int32 => merge_arrays::<i32>(&src_array, &mut dest_array),
			DataType::Int64 => merge_arrays::<i64>(&src_array, &mut dest_array),
			DataType::UInt8 => merge_arrays::<u8>(&src_array, &mut dest_array),
			DataType::UInt16 => merge_arrays::<u16>(&src_array, &mut dest_array),
			DataType::UInt32 => merge_arrays::<u32>(&src_array, &mut dest_array),
			DataType::UInt64 => merge_arrays::<u64>(&src_array, &mut dest_array),
			DataType::Float32 => merge_arrays::<f32>(&src_array, &mut dest_array),
			DataType::Float64 => merge_arrays::<f64>(&src_array, &mut dest_array),
			other => Err(anyhow!("Unsupported data-type {other}")),
		}
		.with_context(|| format!("Cannot concatenate {name:?}"))?;
		println!("{name:?}: concatenated, new shape {shape:?}");
	}
	let src_group = Group::open(src.clone(), "/")
		.with_context(|| format!("Cannot open store metadata in {first:?}"))?;
	let start_date = src_group
		.attributes()
		.get("start_date")
		.cloned()
		.ok_or_else(|| anyhow!("No \"start_date\" attribute in {first:?}"))?;
	let mut dest_group = Group::open(dest.clone(), "/")
		.with_context(|| format!("Cannot open store metadata in {second:?}"))?;
	let attributes = dest_group.attributes_mut();
	attributes.insert("frequency".to_string(), serde_json::Value::from(6));
	attributes.insert("start_date".to_string(), start_date);
	dest_group
		.store_metadata()
		.with_context(|| format!("Cannot update store metadata in {second:?}"))?;
	Ok(())
}

fn merge_arrays<T>(
	src: &Array<dyn ReadableListableStorageTraits>,
	dest: &mut Array<dyn ReadableWritableListableStorageTraits>,
) -> Result<Vec<u64>>
where
	T: Element + ElementOwned,
{
	let front = src
		.retrieve_array_subset_ndarray::<T>(&ArraySubset::new_with_shape(src.shape().to_vec()))?;
	let back = dest
		.retrieve_array_subset_ndarray::<T>(&ArraySubset::new_with_shape(dest.shape().to_vec()))?;
	// The source rows hold the earlier time range and go first.
	let combined = ndarray::concatenate(Axis(0), &[front.view(), back.view()])?;
	let shape: Vec<u64> = combined.shape().iter().map(|&extent| extent as u64).collect();
	dest.set_shape(shape.clone());
	dest.store_metadata()?;
	dest.store_array_subset_ndarray(&vec![0; shape.len()], combined)?;
	Ok(shape)
}

fn override_coords(coords: &Path, dest: &Path) -> Result<()> {
	let file =
		netcdf::open(coords).with_context(|| format!("Cannot open coordinate file {coords:?}"))?;
	let latitudes = coordinate_values(&file, "lat", coords)?;
	let longitudes = coordinate_values(&file, "lon", coords)?;
	let storage: ReadableWritableListableStorage = Arc::new(
		FilesystemStore::new(dest).with_context(|| format!("Cannot open zarr store {dest:?}"))?,
	);
	for (name, values) in [("latitudes", latitudes), ("longitudes", longitudes)] {
		let path = NodePath::new(&format!("/{name}"))?;
		if !node_exists(&storage, &path)? {
			println!("{name:?}: not found in the zarr store");
			continue;
		}
		let array = Array::open(storage.clone(), &format!("/{name}"))
			.with_context(|| format!("Cannot open array {name:?} in {dest:?}"))?;
		write_coordinate(&array, name, &values)
			.with_context(|| format!("Cannot override {name:?} in {dest:?}"))?;
		println!("{name:?}: updated in {dest:?}");
	}
	Ok(())
}

fn coordinate_values(file: &netcdf::File, name: &str, path: &Path) -> Result<Vec<f64>> {
	let variable = file
		.variable(name)
		.ok_or_else(|| anyhow!("No {name:?} variable in {path:?}"))?;
	variable
		.get_values::<f64, _>(..)
		.with_context(|| format!("Cannot read {name:?} from {path:?}"))
}

fn write_coordinate(
	array: &Array<dyn ReadableWritableListableStorageTraits>,
	name: &str,
	values: &[f64],
) -> Result<()> {
	// Coordinates overwrite the existing extent, they never resize it.
	let expected = [values.len() as u64];
	if array.shape() != expected.as_slice() {
		bail!(
			"{} values do not fit the array shape {:?}",
			values.len(),
			array.shape(),
		);
	}
	match array.data_type() {
		DataType::Float64 => {
			array.store_array_subset_ndarray(&[0], Array1::from(values.to_vec()))?;
		}
		DataType::Float32 => {
			let values: Vec<f32> = values.iter().map(|&value| value as f32).collect();
			array.store_array_subset_ndarray(&[0], Array1::from(values))?;
		}
		other => bail!("Unsupported data-type {other} for array {name:?}"),
	}
	Ok(())
}
