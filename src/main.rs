use benchmesh::error::AppResult;

fn main() -> AppResult<()> {
    benchmesh::entry::run()
}
